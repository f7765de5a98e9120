use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// One recognized frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackTrace {
    /// "frame", "vm" or "native".
    pub style: &'static str,
    pub exception: Option<String>,
    pub frames: Vec<StackFrame>,
}

// at com.example.Service.handle(Service.java:42)
static FRAME_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*at\s+(?P<function>[\w$.<>]+)\((?:(?P<file>[^:)]+):(?P<line>\d+)|[^)]*)\)"#)
        .unwrap()
});

// File "app/worker.py", line 88, in run_task
static VM_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)(?:, in (?P<function>\S+))?"#)
        .unwrap()
});

// #3 0x00007f1c in worker_loop () at src/worker.c:217
static NATIVE_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*#\d+\s+(?:0x[0-9a-fA-F]+\s+in\s+)?(?P<function>[\w:~<>]+)\s*\([^)]*\)(?:\s+at\s+(?P<file>[^:\s]+):(?P<line>\d+))?",
    )
    .unwrap()
});

static EXCEPTION_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[\w.]*(?:Exception|Error)[\w.]*)(?::\s*.*)?$").unwrap()
});

/// Recognize a multi-line stack trace. Invoked on demand by consumers, never
/// on the ingestion path. Returns None when fewer than two frames match.
pub fn parse_stack_trace(text: &str) -> Option<StackTrace> {
    let lines: Vec<&str> = text.lines().collect();

    let mut frame_hits = Vec::new();
    let mut vm_hits = Vec::new();
    let mut native_hits = Vec::new();

    for line in &lines {
        if let Some(caps) = FRAME_STYLE.captures(line) {
            frame_hits.push(StackFrame {
                function: caps["function"].to_string(),
                file: caps.name("file").map(|m| m.as_str().to_string()),
                line: caps.name("line").and_then(|m| m.as_str().parse().ok()),
            });
        } else if let Some(caps) = VM_STYLE.captures(line) {
            vm_hits.push(StackFrame {
                function: caps
                    .name("function")
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| "<module>".to_string()),
                file: Some(caps["file"].to_string()),
                line: caps["line"].parse().ok(),
            });
        } else if let Some(caps) = NATIVE_STYLE.captures(line) {
            native_hits.push(StackFrame {
                function: caps["function"].to_string(),
                file: caps.name("file").map(|m| m.as_str().to_string()),
                line: caps.name("line").and_then(|m| m.as_str().parse().ok()),
            });
        }
    }

    let (style, frames) = [
        ("frame", frame_hits),
        ("vm", vm_hits),
        ("native", native_hits),
    ]
    .into_iter()
    .max_by_key(|(_, frames)| frames.len())?;

    if frames.len() < 2 {
        return None;
    }

    // The exception line is the first header-looking line (JVM style) or the
    // last line after a Python traceback.
    let exception = match style {
        "vm" => lines
            .iter()
            .rev()
            .find(|l| EXCEPTION_HEAD.is_match(l.trim()))
            .map(|l| l.trim().to_string()),
        _ => lines
            .iter()
            .find(|l| EXCEPTION_HEAD.is_match(l.trim()))
            .map(|l| l.trim().to_string()),
    };

    Some(StackTrace {
        style,
        exception,
        frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_frame_style() {
        let text = "java.lang.IllegalStateException: boom\n\
                    \tat com.example.Service.handle(Service.java:42)\n\
                    \tat com.example.Main.main(Main.java:9)";
        let trace = parse_stack_trace(text).unwrap();
        assert_eq!(trace.style, "frame");
        assert_eq!(trace.frames.len(), 2);
        assert_eq!(trace.frames[0].function, "com.example.Service.handle");
        assert_eq!(trace.frames[0].file.as_deref(), Some("Service.java"));
        assert_eq!(trace.frames[0].line, Some(42));
        assert!(trace.exception.unwrap().contains("IllegalStateException"));
    }

    #[test]
    fn recognizes_vm_style() {
        let text = "Traceback (most recent call last):\n\
                    \x20 File \"app/worker.py\", line 88, in run_task\n\
                    \x20 File \"app/db.py\", line 12, in query\n\
                    ValueError: bad input";
        let trace = parse_stack_trace(text).unwrap();
        assert_eq!(trace.style, "vm");
        assert_eq!(trace.frames[0].file.as_deref(), Some("app/worker.py"));
        assert_eq!(trace.frames[0].line, Some(88));
        assert_eq!(trace.frames[0].function, "run_task");
        assert_eq!(trace.exception.as_deref(), Some("ValueError: bad input"));
    }

    #[test]
    fn recognizes_native_style() {
        let text = "#0 0x00007f1c in worker_loop () at src/worker.c:217\n\
                    #1 0x00007f2a in main () at src/main.c:31";
        let trace = parse_stack_trace(text).unwrap();
        assert_eq!(trace.style, "native");
        assert_eq!(trace.frames[1].function, "main");
        assert_eq!(trace.frames[1].line, Some(31));
    }

    #[test]
    fn single_frame_is_not_a_trace() {
        assert!(parse_stack_trace("at com.example.Only.one(Only.java:1)").is_none());
        assert!(parse_stack_trace("plain log line with no frames").is_none());
    }
}
