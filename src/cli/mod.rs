//! CLI 모듈
//!
//! ragd CLI 명령어 정의 및 구현

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::rag::{QueryRequest, RagService};
use crate::server;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "ragd")]
#[command(version, about = "로컬 RAG 서버 (Ollama 기반)", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    /// 생략하면 serve
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// HTTP 서버 실행
    Serve,

    /// 텍스트 또는 파일을 지식베이스에 추가 (완료까지 대기)
    Ingest {
        /// 직접 입력할 텍스트
        #[arg(short, long, conflicts_with = "file")]
        text: Option<String>,

        /// 수집할 UTF-8 텍스트 파일
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// source 이름 (기본: direct-input 또는 파일명)
        #[arg(short, long)]
        source: Option<String>,
    },

    /// 질문하고 답변 받기
    Query {
        /// 질문
        question: String,

        /// 응답 언어 locale (기본: RESPONSE_LANG)
        #[arg(short, long)]
        language: Option<String>,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let settings = cli.settings;
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => server::serve(&settings).await,
        Commands::Ingest { text, file, source } => cmd_ingest(&settings, text, file, source).await,
        Commands::Query { question, language } => cmd_query(&settings, question, language).await,
        Commands::Status => cmd_status(&settings).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 문서 수집 명령어 (ingest)
///
/// 서버와 같은 파이프라인을 현재 프로세스에서 끝까지 실행합니다.
async fn cmd_ingest(
    settings: &Settings,
    text: Option<String>,
    file: Option<PathBuf>,
    source: Option<String>,
) -> Result<()> {
    let request = if let Some(ref path) = file {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("파일 읽기 실패: {}", path.display()))?;
        println!("[*] 파일: {} ({})", path.display(), format_bytes(bytes.len()));

        let filename = source.or_else(|| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
        });
        RagService::prepare_file(bytes, filename)?
    } else if let Some(text) = text {
        RagService::prepare_text(text, source)?
    } else {
        bail!("--text 또는 --file 중 하나를 지정해야 합니다");
    };

    let service = RagService::from_settings(settings)
        .await
        .context("RagService 초기화 실패")?;

    println!("[*] 청킹 및 임베딩 중... (source: {})", request.source);
    let outcome = service.ingest(request).await?;

    if outcome.chunks == 0 {
        println!("[!] 저장할 내용이 없습니다 (공백뿐인 입력)");
        return Ok(());
    }

    println!("[OK] {} 청크 저장됨", outcome.chunks);
    println!("     source: {}", outcome.source);
    if outcome.summarized {
        println!("     요약 청크 포함");
    }

    Ok(())
}

/// 질의 명령어 (query)
async fn cmd_query(settings: &Settings, question: String, language: Option<String>) -> Result<()> {
    let service = RagService::from_settings(settings)
        .await
        .context("RagService 초기화 실패")?;

    println!("[*] 질의 중: \"{}\"", question);

    let mut request = QueryRequest::new(question);
    request.language = language;
    let result = service.query(request).await?;

    if let Some(ref thinking) = result.thinking {
        println!("\n   추론: {}", truncate_text(thinking, 200));
    }
    println!("\n{}", result.answer);

    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(settings: &Settings) -> Result<()> {
    println!("ragd v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] 데이터 디렉토리: {}", settings.persist_dir.display());
    println!("[*] 벡터 백엔드: {:?}", settings.vector_backend);
    println!("[*] Ollama: {}", settings.ollama_host);
    println!(
        "[*] 모델: embed={}, llm={}",
        settings.embed_model, settings.llm_model
    );

    let service = match RagService::from_settings(settings).await {
        Ok(service) => service,
        Err(e) => {
            println!("[!] 초기화 실패: {:#}", e);
            return Ok(());
        }
    };

    match service.chunk_count().await {
        Ok(count) => println!("[OK] 저장된 청크: {} 개", count),
        Err(e) => println!("[!] 통계 조회 실패: {}", e),
    }

    match service.check_generation_model().await {
        Ok(()) => println!("[OK] 생성 모델 사용 가능"),
        Err(e) => println!("[!] 생성 모델 확인 실패: {}", e),
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
