//! Storage writes of the retrace pipeline.
//!
//! These functions are only ever called from the single consumer of the
//! [`RetracePool`](crate::pool::RetracePool).

use crate::error::RepositoryError;
use crate::repository::{NewFrame, NewSymbolSource, RetraceRepository};
use crate::resolve::{DemangleCache, demangle};
use crate::tools::DebugTools;
use crate::types::{ResolvedFrame, SymbolId, SymbolSourceId, SymbolSourceKey};

/// Returns the id of the symbol `name` in `normalized_path`, creating it if needed.
///
/// Symbols which have no demangled name yet get one, if `name` demangles at all.
pub fn get_or_create_symbol(
    repo: &mut dyn RetraceRepository,
    tools: &dyn DebugTools,
    cache: &DemangleCache,
    name: &str,
    normalized_path: &str,
) -> Result<SymbolId, RepositoryError> {
    match repo.find_symbol(name, normalized_path)? {
        Some(symbol) => {
            if symbol.nice_name.is_none() {
                if let Some(nice_name) = demangle(tools, cache, name) {
                    repo.set_symbol_nice_name(symbol.id, &nice_name)?;
                }
            }
            Ok(symbol.id)
        }
        None => {
            tracing::debug!("Creating new symbol '{}' @ '{}'", name, normalized_path);
            let nice_name = demangle(tools, cache, name);
            repo.save_symbol(name, nice_name.as_deref(), normalized_path)
        }
    }
}

/// Stores the result of resolving a symbol source.
///
/// `frames` is the output of [`address_to_line`](crate::resolve::address_to_line): zero or more
/// inlined functions followed by the function containing the address. Every inlined function
/// gets a synthetic symbol source keyed by its source line and a frame inserted before each
/// frame referencing the resolved source. Later frames of the thread move down by one.
///
/// Returns `false` without touching the storage if the symbol source is resolved already.
pub fn apply_resolution(
    repo: &mut dyn RetraceRepository,
    tools: &dyn DebugTools,
    cache: &DemangleCache,
    ssource_id: SymbolSourceId,
    normalized_path: &str,
    frames: &[ResolvedFrame],
) -> Result<bool, RepositoryError> {
    let ssource = repo.symbol_source(ssource_id)?;
    if ssource.is_resolved() {
        tracing::trace!("Symbol source {} is resolved already", ssource.id);
        return Ok(false);
    }
    let Some((outer, inlined)) = frames.split_last() else {
        return Ok(false);
    };

    for frame in inlined {
        tracing::debug!("Unwinding inlined function '{}'", frame.function);
        let key = SymbolSourceKey::new_inlined(
            ssource.key.build_id.clone(),
            ssource.key.path.clone(),
            frame.line,
        );

        let inlined_id = match repo.find_symbol_source(&key)? {
            Some(existing) => existing.id,
            None => {
                let symbol =
                    get_or_create_symbol(repo, tools, cache, &frame.function, normalized_path)?;
                repo.save_symbol_source(NewSymbolSource {
                    symbol: Some(symbol),
                    source_path: Some(frame.source_file.clone()),
                    line_number: Some(frame.line),
                    ..NewSymbolSource::new(key)
                })?
            }
        };

        insert_inlined_frames(repo, ssource.id, inlined_id)?;
    }

    tracing::debug!("Result: {}", outer.function);
    let symbol = get_or_create_symbol(repo, tools, cache, &outer.function, normalized_path)?;
    repo.resolve_symbol_source(ssource.id, symbol, &outer.source_file, outer.line)?;

    Ok(true)
}

/// Inserts a frame of `inlined` before every frame referencing `ssource`.
fn insert_inlined_frames(
    repo: &mut dyn RetraceRepository,
    ssource: SymbolSourceId,
    inlined: SymbolSourceId,
) -> Result<(), RepositoryError> {
    for referencing in repo.frames_for_symbol_source(ssource)? {
        // orders move with every insertion, so look at the current state of the thread
        let thread_frames = repo.thread_frames(referencing.thread)?;
        let Some(idx) = thread_frames.iter().position(|f| f.id == referencing.id) else {
            continue;
        };

        if idx > 0 {
            let previous = &thread_frames[idx - 1];
            if previous.inlined && previous.symbol_source == inlined {
                continue;
            }
        }

        let order = thread_frames[idx].order;
        repo.shift_frame_orders(referencing.thread, order, 1)?;
        repo.insert_frame(NewFrame {
            thread: referencing.thread,
            order,
            symbol_source: inlined,
            inlined: true,
            reliable: referencing.reliable,
        })?;
    }

    Ok(())
}

/// Moves a symbol source to `path`, the location its binary is actually packaged at.
///
/// If another symbol source already exists at the new location, the two are merged: all frames
/// are repointed to the existing one and `ssource_id` is deleted. Returns the id of the symbol
/// source that lives at `path` afterwards.
pub fn fix_symbol_source_path(
    repo: &mut dyn RetraceRepository,
    ssource_id: SymbolSourceId,
    path: &str,
) -> Result<SymbolSourceId, RepositoryError> {
    let ssource = repo.symbol_source(ssource_id)?;
    if ssource.path() == path {
        return Ok(ssource_id);
    }

    let key = ssource.key.with_path(path);
    match repo.find_symbol_source(&key)? {
        Some(existing) => {
            tracing::debug!(
                "Merging symbol source {} into {} at '{}'",
                ssource_id,
                existing.id,
                path
            );
            repo.merge_symbol_source(ssource_id, existing.id)?;
            Ok(existing.id)
        }
        None => {
            tracing::debug!("Fixing path: {} ~> {}", ssource.path(), path);
            repo.update_symbol_source_path(ssource_id, path)?;
            Ok(ssource_id)
        }
    }
}
