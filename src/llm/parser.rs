//! 응답 파서 - `<think>...</think>` 추론 블록 분리
//!
//! 모델 출력이 어떤 형태든 실패하지 않습니다. 마커가 짝이 맞지 않거나
//! 중첩되면 출력 전체를 답변으로 취급합니다.

use serde::Serialize;

/// 추론 블록 시작 마커
pub const THINK_OPEN: &str = "<think>";
/// 추론 블록 끝 마커
pub const THINK_CLOSE: &str = "</think>";

/// 파싱 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedResponse {
    /// 마커 바깥 텍스트 (원래 순서, 앞뒤 공백 제거)
    pub answer: String,
    /// 마커 안쪽 텍스트. 블록이 없으면 `None`
    pub thinking: Option<String>,
}

impl ParsedResponse {
    fn unparsed(raw: &str) -> Self {
        Self {
            answer: raw.trim().to_string(),
            thinking: None,
        }
    }
}

/// 원시 출력에서 답변과 추론을 분리
///
/// 순차적인(중첩되지 않은) 블록이 여러 개면 빈 줄로 이어 붙입니다.
pub fn parse_response(raw: &str) -> ParsedResponse {
    let mut answer = String::new();
    let mut blocks: Vec<&str> = Vec::new();
    let mut rest = raw;

    loop {
        let open = rest.find(THINK_OPEN);
        let close = rest.find(THINK_CLOSE);

        match (open, close) {
            (None, None) => {
                answer.push_str(rest);
                break;
            }
            // 여는 마커 없이 닫는 마커
            (None, Some(_)) => return ParsedResponse::unparsed(raw),
            (Some(o), Some(c)) if c < o => return ParsedResponse::unparsed(raw),
            // 닫히지 않은 블록
            (Some(_), None) => return ParsedResponse::unparsed(raw),
            (Some(o), Some(c)) => {
                let inner = &rest[o + THINK_OPEN.len()..c];
                if inner.contains(THINK_OPEN) {
                    // 중첩
                    return ParsedResponse::unparsed(raw);
                }
                answer.push_str(&rest[..o]);
                blocks.push(inner.trim());
                rest = &rest[c + THINK_CLOSE.len()..];
            }
        }
    }

    if blocks.is_empty() {
        return ParsedResponse::unparsed(raw);
    }

    ParsedResponse {
        answer: answer.trim().to_string(),
        thinking: Some(blocks.join("\n\n")),
    }
}

// ============================================================================
// Tests
// ============================================================================
