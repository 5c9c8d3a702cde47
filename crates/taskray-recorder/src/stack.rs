//! Stack capture for recorded exceptions.

use crate::types::StackFrame;

/// Symbols from the capture machinery itself, skipped at the top of the stack.
const SKIPPED_PREFIXES: &[&str] = &[
    "backtrace::",
    "<backtrace::",
    "taskray_recorder::stack::",
];

/// Capture the current call stack, innermost frame first.
///
/// Frames without a resolved symbol name are skipped. The caller applies the
/// depth limit so the number of dropped frames can be recorded.
pub fn capture() -> Vec<StackFrame> {
    let backtrace = backtrace::Backtrace::new();
    backtrace
        .frames()
        .iter()
        .flat_map(|frame| frame.symbols())
        .filter_map(|symbol| {
            let label = symbol.name()?.to_string();
            let frame = StackFrame {
                path: symbol.filename().map(|p| p.display().to_string()),
                line: symbol.lineno(),
                label,
            };
            Some(frame)
        })
        .skip_while(|frame| {
            SKIPPED_PREFIXES
                .iter()
                .any(|prefix| frame.label.starts_with(prefix))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_skips_own_frames() {
        let frames = capture();
        assert!(!frames.is_empty());
        assert!(!frames[0].label.starts_with("taskray_recorder::stack::capture"));
    }
}
