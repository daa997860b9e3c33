//! 컴파일러 진단 메시지 수집
//!
//! 컴파일러가 내보내는 에러/경고를 프로세스 출력에 직접 쓰지 않고
//! `tcc` 타깃으로 로깅한 뒤, 세션별로 보관하여 에러 보고에 사용한다.

use std::sync::Arc;

use parking_lot::Mutex;

/// 진단 메시지를 로깅할 때 쓰는 고정 컴포넌트 이름
pub const COMPONENT: &str = "tcc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    /// `file.c:3: warning: ...` 형태에서 심각도 추출 (그 외는 에러)
    pub fn parse(raw: &str) -> Self {
        let message = raw.trim_end().to_string();
        let severity = if message.contains("warning: ") {
            Severity::Warning
        } else {
            Severity::Error
        };
        Self { severity, message }
    }
}

/// 세션 하나의 진단 싱크
///
/// 클론은 같은 저장소를 공유한다. 컴파일러 콜백에 넘겨도 세션 쪽에서
/// 그대로 읽을 수 있다.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticSink {
    records: Arc<Mutex<Vec<Diagnostic>>>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 컴파일러 메시지 한 줄 기록
    pub fn emit(&self, raw: &str) {
        let diagnostic = Diagnostic::parse(raw);
        if diagnostic.message.is_empty() {
            return;
        }

        match diagnostic.severity {
            Severity::Error => tracing::error!(target: COMPONENT, "{}", diagnostic.message),
            Severity::Warning => tracing::warn!(target: COMPONENT, "{}", diagnostic.message),
        }

        self.records.lock().push(diagnostic);
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.records.lock().clone()
    }

    pub fn has_errors(&self) -> bool {
        self.records
            .lock()
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// 에러 보고용 텍스트 (한 줄에 메시지 하나)
    pub fn render(&self) -> String {
        self.records
            .lock()
            .iter()
            .map(|d| d.message.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_are_told_apart_from_errors() {
        let sink = DiagnosticSink::new();
        sink.emit("hello.c:4: warning: implicit declaration of function 'puts'\n");
        assert!(!sink.has_errors());

        sink.emit("hello.c:9: error: ';' expected (got \"}\")");
        assert!(sink.has_errors());

        let diags = sink.diagnostics();
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!(diags[1].severity, Severity::Error);
    }

    #[test]
    fn clones_share_records() {
        let sink = DiagnosticSink::new();
        let forwarded = sink.clone();
        forwarded.emit("tcc: error: file 'missing.c' not found");
        forwarded.emit("   ");

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.render(), "tcc: error: file 'missing.c' not found");
    }
}
