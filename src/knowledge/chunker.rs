//! Text Chunking Module
//!
//! 문단 → 문장 → 문자 단위 순으로 경계를 존중하며 텍스트를 분할합니다.
//! 각 청크는 원문의 정확한 슬라이스이며, 원문 내 바이트 오프셋을 함께 가집니다.

use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
///
/// 길이는 모두 문자(char) 단위입니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkConfig {
    /// 최대 청크 크기 (문자 수)
    pub max_characters: usize,
    /// 이웃 청크와 공유하는 최대 오버랩 (문자 수)
    pub overlap_characters: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_characters: 500,
            overlap_characters: 50,
        }
    }
}

impl ChunkConfig {
    pub fn new(max_characters: usize, overlap_characters: usize) -> Result<Self> {
        let config = Self {
            max_characters,
            overlap_characters,
        };
        config.validate()?;
        Ok(config)
    }

    /// `0 < max` 그리고 `overlap < max` 확인
    pub fn validate(&self) -> Result<()> {
        if self.max_characters == 0 {
            anyhow::bail!("chunk size must be greater than zero");
        }
        if self.overlap_characters >= self.max_characters {
            anyhow::bail!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.overlap_characters,
                self.max_characters
            );
        }
        Ok(())
    }
}

// ============================================================================
// Types
// ============================================================================

/// 분할 결과 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    /// 원문 슬라이스
    pub text: String,
    /// 원문 내 바이트 오프셋
    pub offset: usize,
}

/// 원문 내 바이트 범위 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Unit {
    start: usize,
    end: usize,
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    ///
    /// 같은 입력과 설정이면 항상 같은 경계를 돌려줍니다.
    /// 빈 문자열이나 공백뿐인 입력은 빈 벡터입니다.
    fn chunk(&self, text: &str) -> Vec<TextSpan>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// BoundaryChunker
// ============================================================================

/// 경계 인식 청커
///
/// - 문단(빈 줄) 경계 우선
/// - 문단이 너무 길면 문장 경계
/// - 문장 하나가 최대 크기를 넘을 때만 문자 단위로 자름
pub struct BoundaryChunker {
    config: ChunkConfig,
}

impl BoundaryChunker {
    /// 설정으로 생성 (설정은 검증된 상태여야 함)
    pub fn new(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// 기본 설정으로 생성
    pub fn with_defaults() -> Self {
        Self {
            config: ChunkConfig::default(),
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// 문단 단위 분할 (앞뒤 공백 제외)
    fn split_paragraphs(text: &str) -> Vec<Unit> {
        let mut units = Vec::new();
        let mut last = 0;

        for sep in paragraph_re().find_iter(text) {
            push_trimmed(text, last, sep.start(), &mut units);
            last = sep.end();
        }
        push_trimmed(text, last, text.len(), &mut units);

        units
    }

    /// 긴 문단을 문장 경계에서 분할
    fn split_sentences(text: &str, para: Unit) -> Vec<Unit> {
        let slice = &text[para.start..para.end];
        let mut units = Vec::new();
        let mut last = 0;

        for end in sentence_re().find_iter(slice) {
            push_trimmed(text, para.start + last, para.start + end.end(), &mut units);
            last = end.end();
        }
        push_trimmed(text, para.start + last, para.end, &mut units);

        units
    }

    /// 최대 크기를 넘는 단위를 문자 단위로 자름
    ///
    /// 조각끼리는 `overlap` 만큼 겹칩니다.
    fn hard_cut(&self, text: &str, unit: Unit) -> Vec<Unit> {
        let max = self.config.max_characters;
        let step = max - self.config.overlap_characters;

        // 각 문자의 바이트 위치 + 끝 위치
        let mut bounds: Vec<usize> = text[unit.start..unit.end]
            .char_indices()
            .map(|(i, _)| unit.start + i)
            .collect();
        bounds.push(unit.end);
        let char_count = bounds.len() - 1;

        let mut pieces = Vec::new();
        let mut first = 0;
        loop {
            let last = (first + max).min(char_count);
            pieces.push(Unit {
                start: bounds[first],
                end: bounds[last],
            });
            if last >= char_count {
                break;
            }
            first += step;
        }

        pieces
    }

    /// 원문을 청킹 단위(문단/문장/조각)로 분해
    fn units(&self, text: &str) -> Vec<Unit> {
        let max = self.config.max_characters;
        let mut units = Vec::new();

        for para in Self::split_paragraphs(text) {
            if char_len(text, para.start, para.end) <= max {
                units.push(para);
                continue;
            }

            for sentence in Self::split_sentences(text, para) {
                if char_len(text, sentence.start, sentence.end) <= max {
                    units.push(sentence);
                } else {
                    units.extend(self.hard_cut(text, sentence));
                }
            }
        }

        units
    }

    /// 단위들을 최대 크기까지 탐욕적으로 묶고, 앞 청크의 꼬리를 오버랩으로 이어받음
    fn pack(&self, text: &str, units: Vec<Unit>) -> Vec<TextSpan> {
        let max = self.config.max_characters;
        let overlap = self.config.overlap_characters;

        let mut spans = Vec::new();
        let mut window: Vec<Unit> = Vec::new();

        for unit in units {
            if let Some(head) = window.first() {
                if char_len(text, head.start, unit.end) > max {
                    spans.push(to_span(text, &window));

                    // 앞 청크 꼬리 중 overlap 이하인 단위만 유지
                    let tail_end = window[window.len() - 1].end;
                    let keep_from = window
                        .iter()
                        .position(|u| char_len(text, u.start, tail_end) <= overlap)
                        .unwrap_or(window.len());
                    window.drain(..keep_from);

                    while let Some(head) = window.first() {
                        if char_len(text, head.start, unit.end) <= max {
                            break;
                        }
                        window.remove(0);
                    }
                }
            }
            window.push(unit);
        }

        if !window.is_empty() {
            spans.push(to_span(text, &window));
        }

        spans
    }
}

impl Chunker for BoundaryChunker {
    fn chunk(&self, text: &str) -> Vec<TextSpan> {
        if text.trim().is_empty() {
            return vec![];
        }

        let units = self.units(text);
        self.pack(text, units)
    }

    fn name(&self) -> &'static str {
        "BoundaryChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t\r]*\n\s*").expect("valid paragraph regex"))
}

fn sentence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?。！？]+\s+").expect("valid sentence regex"))
}

/// `[start, end)` 범위의 공백을 걷어내고 비어있지 않으면 추가
fn push_trimmed(text: &str, start: usize, end: usize, units: &mut Vec<Unit>) {
    let slice = &text[start..end];
    let trimmed = slice.trim_start();
    let start = start + (slice.len() - trimmed.len());
    let trimmed = trimmed.trim_end();
    if !trimmed.is_empty() {
        units.push(Unit {
            start,
            end: start + trimmed.len(),
        });
    }
}

#[inline]
fn char_len(text: &str, start: usize, end: usize) -> usize {
    text[start..end].chars().count()
}

fn to_span(text: &str, window: &[Unit]) -> TextSpan {
    let start = window[0].start;
    let end = window[window.len() - 1].end;
    TextSpan {
        text: text[start..end].to_string(),
        offset: start,
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 기본 청커 생성
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(BoundaryChunker::with_defaults())
}

/// 설정을 지정한 청커 생성
pub fn boundary_chunker(config: ChunkConfig) -> Result<Box<dyn Chunker>> {
    Ok(Box::new(BoundaryChunker::new(config)?))
}

// ============================================================================
// Tests
// ============================================================================
