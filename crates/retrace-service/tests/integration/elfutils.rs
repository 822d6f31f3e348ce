use std::path::Path;
use std::time::Duration;

use retrace_service::config::{RetraceConfig, ToolsConfig};
use retrace_service::error::{ResolveError, ToolError};
use retrace_service::resolve::{
    AddressMode, demangle, demangle_cache, function_offset_map, resolve_offset,
};
use retrace_service::tools::{DebugTools, Elfutils};
use retrace_test;

/// Writes `eu-*` and `c++filt` stand-ins answering for a binary loaded at `0x1000`.
fn elfutils(dir: &Path) -> Elfutils {
    let eu_unstrip = retrace_test::script(
        dir,
        "eu-unstrip",
        r#"printf '0x1000+0x2000 abc@0x400 %s - foo\n' "$3""#,
    );
    let eu_addr2line = retrace_test::script(
        dir,
        "eu-addr2line",
        r#"case "$4" in
    0x1010) printf 'main+0x10\n/src/foo.c:12\n' ;;
    0x1020) printf 'parse inlined at /src/foo.c:20 in run\n/src/parse.c:5:3\n' ;;
    0x102f|0x102e) printf '??\n/src/foo.c:30\n' ;;
    0x102d) printf 'handler\n/src/foo.c:30\n' ;;
    *) printf '??\n??:0\n' ;;
esac"#,
    );
    let eu_readelf = retrace_test::script(
        dir,
        "eu-readelf",
        r#"printf '%s\n' \
    'Symbol table [27] .symtab contains 3 entries:' \
    '   Num:    Value   Size Type    Bind   Vis          Ndx Name' \
    '     1: ffffffff81000000    128 FUNC    GLOBAL DEFAULT    1 __schedule' \
    '     2: ffffffff81000100      0 NOTYPE  LOCAL  DEFAULT    1 panic' \
    '     3: ffffffff82000000      8 OBJECT  GLOBAL DEFAULT    5 jiffies'"#,
    );
    let cxxfilt = retrace_test::script(
        dir,
        "c++filt",
        r#"case "$1" in
    _ZN3foo3barEv) echo 'foo::bar()' ;;
    *) echo "$1" ;;
esac"#,
    );

    Elfutils::new(&RetraceConfig {
        tool_timeout: Duration::from_secs(10),
        tools: ToolsConfig {
            eu_unstrip,
            eu_addr2line,
            eu_readelf,
            cxxfilt,
            ..Default::default()
        },
        ..Default::default()
    })
}

#[test]
fn test_resolve_with_tools() {
    retrace_test::setup();
    let dir = retrace_test::tempdir();
    let tools = elfutils(dir.path());
    let binary = Path::new("/unpacked/usr/bin/foo");
    let debug_dir = Path::new("/unpacked/usr/lib/debug");

    let resolve = |offset| resolve_offset(&tools, binary, debug_dir, offset, AddressMode::Relative);

    insta::assert_debug_snapshot!(resolve(0x10).unwrap(), @r#"
    [
        ResolvedFrame {
            function: "main",
            source_file: "/src/foo.c",
            line: 12,
        },
    ]
    "#);

    insta::assert_debug_snapshot!(resolve(0x20).unwrap(), @r#"
    [
        ResolvedFrame {
            function: "parse",
            source_file: "/src/parse.c",
            line: 5,
        },
        ResolvedFrame {
            function: "run",
            source_file: "/src/foo.c",
            line: 20,
        },
    ]
    "#);

    // two attempts at the same location before the function is found
    let frames = resolve(0x2f).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].function, "handler");

    assert!(matches!(resolve(0x40), Err(ResolveError::FunctionNotFound)));
}

#[test]
fn test_kernel_offset_map() {
    retrace_test::setup();
    let dir = retrace_test::tempdir();
    let tools = elfutils(dir.path());

    let files = [
        dir.path().join("usr/lib/debug/lib/modules/5.14.0/vmlinux"),
        dir.path().join("usr/lib/debug/lib/modules/5.14.0/kernel/drivers/net/e1000e.ko.debug"),
    ];
    let map = function_offset_map(&tools, &files);

    let vmlinux = &map["vmlinux"];
    assert_eq!(vmlinux["schedule"], 0xffffffff81000000);
    assert_eq!(vmlinux["panic"], 0xffffffff81000100);
    assert!(!vmlinux.contains_key("jiffies"));
    assert!(map.contains_key("e1000e"));
}

#[test]
fn test_demangle_with_tools() {
    retrace_test::setup();
    let dir = retrace_test::tempdir();
    let tools = elfutils(dir.path());
    let cache = demangle_cache(10);

    assert_eq!(
        demangle(&tools, &cache, "_ZN3foo3barEv").as_deref(),
        Some("foo::bar()")
    );
    assert_eq!(demangle(&tools, &cache, "main"), None);
}

#[test]
fn test_hanging_tool_is_killed() {
    retrace_test::setup();
    let dir = retrace_test::tempdir();
    let hanging = retrace_test::script(dir.path(), "hanging", "exec sleep 30");

    let tools = Elfutils::new(&RetraceConfig {
        tool_timeout: Duration::from_millis(200),
        tools: ToolsConfig {
            eu_unstrip: hanging,
            ..Default::default()
        },
        ..Default::default()
    });

    let result = tools.unstrip(Path::new("/usr/bin/foo"));
    assert!(matches!(result, Err(ToolError::Timeout { .. })));
}
