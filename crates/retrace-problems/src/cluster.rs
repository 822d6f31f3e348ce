//! Grouping of reports into problems.
//!
//! Reports whose backtraces share a hash of the same kind describe the same defect. Reports are
//! connected transitively, each connected set is a cluster. Clusters then take over the
//! problems their reports were assigned to before, so problem ids stay stable across runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use retrace_service::config::ProcessingConfig;
use retrace_service::error::RepositoryError;
use retrace_service::repository::RetraceRepository;
use retrace_service::types::{HashKind, ProblemId, ReportId};

use crate::ProblemType;
use crate::backtrace::crash_function;

/// Outcome of [`create_problems`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub clusters: usize,
    /// Existing problems assigned to a cluster.
    pub reused: usize,
    pub created: usize,
    /// Problems left without reports and deleted.
    pub removed: usize,
}

impl fmt::Display for ClusterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} clusters: {} problems reused, {} created, {} removed",
            self.clusters, self.reused, self.created, self.removed
        )
    }
}

/// Disjoint sets of `0..len`.
#[derive(Debug)]
struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        // the smaller root wins
        match a.cmp(&b) {
            std::cmp::Ordering::Less => self.parent[b] = a,
            std::cmp::Ordering::Greater => self.parent[a] = b,
            std::cmp::Ordering::Equal => {}
        }
    }
}

/// Groups `reports` into clusters of at most `max_size` reports.
///
/// Every report ends up in exactly one cluster. Clusters and their reports are sorted by id.
fn create_clusters(
    repo: &dyn RetraceRepository,
    reports: &[ReportId],
    max_size: usize,
) -> Result<Vec<Vec<ReportId>>, RepositoryError> {
    let mut sets = DisjointSets::new(reports.len());
    let mut seen: HashMap<(HashKind, String), usize> = HashMap::new();

    for (index, report) in reports.iter().enumerate() {
        for backtrace in repo.report_backtraces(*report)? {
            for hash in backtrace.hashes {
                match seen.get(&(hash.kind, hash.hash.clone())) {
                    Some(&other) => sets.union(index, other),
                    None => {
                        seen.insert((hash.kind, hash.hash), index);
                    }
                }
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<ReportId>> = BTreeMap::new();
    for (index, report) in reports.iter().enumerate() {
        clusters.entry(sets.find(index)).or_default().push(*report);
    }

    let max_size = max_size.max(1);
    let mut result = Vec::new();
    for mut cluster in clusters.into_values() {
        cluster.sort();
        if cluster.len() > max_size {
            tracing::debug!(
                "Splitting cluster of {} reports into chunks of {}",
                cluster.len(),
                max_size
            );
        }
        result.extend(cluster.chunks(max_size).map(<[_]>::to_vec));
    }
    Ok(result)
}

/// Picks an existing problem for every cluster that overlaps with one.
///
/// Problems matching a cluster exactly are taken first. The remaining pairs of cluster and problem
/// are assigned in order of the fraction of the cluster's reports the problem shares, across all
/// clusters. A problem is used at most once.
fn match_problems(
    clusters: &[Vec<ReportId>],
    existing: &BTreeMap<ProblemId, BTreeSet<ReportId>>,
) -> Vec<Option<ProblemId>> {
    let mut result = vec![None; clusters.len()];
    let mut used = BTreeSet::new();

    let exact: HashMap<Vec<ReportId>, ProblemId> = existing
        .iter()
        .map(|(problem, reports)| (reports.iter().copied().collect(), *problem))
        .collect();
    for (cluster, slot) in clusters.iter().zip(&mut result) {
        if let Some(&problem) = exact.get(cluster) {
            if used.insert(problem) {
                *slot = Some(problem);
            }
        }
    }

    // (overlap, cluster length, cluster index, problem) for every unmatched cluster
    let mut candidates = Vec::new();
    for (index, cluster) in clusters.iter().enumerate() {
        if result[index].is_some() {
            continue;
        }
        for (problem, reports) in existing {
            let overlap = cluster.iter().filter(|r| reports.contains(r)).count();
            if overlap > 0 {
                candidates.push((overlap, cluster.len(), index, *problem));
            }
        }
    }

    // best ratio first, ties keep cluster and problem order
    candidates.sort_by(|(a, a_len, ..), (b, b_len, ..)| (b * a_len).cmp(&(a * b_len)));

    for (_, _, index, problem) in candidates {
        if result[index].is_some() || used.contains(&problem) {
            continue;
        }
        used.insert(problem);
        result[index] = Some(problem);
    }

    result
}

/// Returns the most common crash function of the backtraces of `reports`.
///
/// Unknown functions are ignored. Ties go to the lexicographically smallest name.
fn cluster_crash_function(
    repo: &dyn RetraceRepository,
    problem_type: ProblemType,
    reports: &[ReportId],
) -> Result<Option<String>, RepositoryError> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for report in reports {
        for backtrace in repo.report_backtraces(*report)? {
            if let Some(function) = crash_function(repo, problem_type, &backtrace)? {
                *counts.entry(function).or_default() += 1;
            }
        }
    }

    let mut best: Option<(String, usize)> = None;
    for (function, count) in counts {
        if best.as_ref().is_none_or(|(_, best)| count > *best) {
            best = Some((function, count));
        }
    }
    Ok(best.map(|(function, _)| function))
}

/// Clusters all reports of `problem_type` and assigns each cluster to a problem.
pub fn create_problems(
    repo: &mut dyn RetraceRepository,
    problem_type: ProblemType,
    config: &ProcessingConfig,
) -> Result<ClusterStats, RepositoryError> {
    let reports = repo.reports_of_type(problem_type.name())?;
    tracing::info!("Clustering {} {} reports", reports.len(), problem_type);

    let mut existing: BTreeMap<ProblemId, BTreeSet<ReportId>> = BTreeMap::new();
    for report in &reports {
        if let Some(problem) = report.problem {
            existing.entry(problem).or_default().insert(report.id);
        }
    }

    let ids: Vec<_> = reports.iter().map(|report| report.id).collect();
    let clusters = create_clusters(repo, &ids, config.max_cluster_size)?;
    let matches = match_problems(&clusters, &existing);

    let mut stats = ClusterStats {
        clusters: clusters.len(),
        ..Default::default()
    };

    for (cluster, matched) in clusters.iter().zip(matches) {
        let problem = match matched {
            Some(problem) => {
                stats.reused += 1;
                problem
            }
            None => {
                stats.created += 1;
                repo.create_problem()?
            }
        };
        tracing::debug!("Assigning {} reports to problem {}", cluster.len(), problem);

        for report in cluster {
            repo.assign_report_problem(*report, problem)?;
        }
        let function = cluster_crash_function(repo, problem_type, cluster)?;
        repo.set_problem_crash_function(problem, function)?;
    }

    for problem in repo.problems()? {
        if repo.problem_reports(problem.id)?.is_empty() {
            tracing::debug!("Removing empty problem {}", problem.id);
            repo.delete_problem(problem.id)?;
            stats.removed += 1;
        }
    }

    tracing::info!("{}", stats);
    Ok(stats)
}
