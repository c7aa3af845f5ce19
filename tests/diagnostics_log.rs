use repl_session::diagnostics;

#[test]
fn debug_log_appends_to_the_configured_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session-debug.log");
    // Must happen before the first debug_log call in this process: the
    // enable flag and sink are latched once.
    unsafe {
        std::env::set_var(diagnostics::DEBUG_FILE_ENV, &path);
    }

    diagnostics::debug_log("first line");
    diagnostics::debug_log("second line");

    let contents = std::fs::read_to_string(&path).expect("log file");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("[repl-session +"));
    assert!(lines[0].ends_with("first line"));
    assert!(lines[1].ends_with("second line"));
}
