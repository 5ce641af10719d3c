//! 프롬프트 조립

use crate::config::Language;
use crate::knowledge::SearchResult;
use crate::llm::{THINK_CLOSE, THINK_OPEN};

/// 검색 결과가 없을 때 컨텍스트 자리에 들어가는 문구
pub const NO_CONTEXT_MARKER: &str = "No relevant context was found.";

/// 질의 프롬프트 생성
///
/// 언어 지시 → 순위대로 번호 붙인 문단 → 질문 → 추론 마커 안내 순서입니다.
/// 검색 결과가 비어 있으면 그 사실을 명시하고 출처 있는 사실을 지어내지 말라고 지시합니다.
pub fn build_prompt(question: &str, language: &Language, passages: &[SearchResult]) -> String {
    let mut prompt = format!(
        "Use the following context to answer the question. \
         Respond in the language specified by locale '{}'.\n\n",
        language
    );

    prompt.push_str("Context:\n");
    if passages.is_empty() {
        prompt.push_str(NO_CONTEXT_MARKER);
        prompt.push_str(
            " Do not present any fact as coming from a document; \
             say that the knowledge base has no information on this if you cannot answer.",
        );
    } else {
        let formatted: Vec<String> = passages
            .iter()
            .enumerate()
            .map(|(i, p)| format!("[{}] {}", i + 1, p.text.trim()))
            .collect();
        prompt.push_str(&formatted.join("\n\n"));
    }

    prompt.push_str(&format!("\n\nQuestion: {}\n\n", question.trim()));
    prompt.push_str(&format!(
        "If you need to reason through the answer, wrap your thinking in \
         {}...{} tags, then provide the answer directly and briefly.",
        THINK_OPEN, THINK_CLOSE
    ));

    prompt
}

/// 수집 시 요약 프롬프트
pub fn build_summary_prompt(source: &str, text: &str) -> String {
    format!(
        "Summarize the following document in a few sentences. \
         Keep names, numbers and terminology exact. Reply with the summary only.\n\n\
         Document ({}):\n{}",
        source,
        text.trim()
    )
}
