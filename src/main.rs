//! # Nexus CLI (`nexus`)
//!
//! The `nexus` binary is the interface to the document chat pipeline:
//! ingest documents into a session, ask questions grounded in them, run
//! staged document reviews, and manage saved sessions and reports.
//!
//! ## Usage
//!
//! ```bash
//! nexus --config ./config/nexus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nexus init` | Create the data directories and a starter config |
//! | `nexus ingest <files>` | Extract, chunk, embed, and index documents |
//! | `nexus ask "<question>"` | One grounded turn with a streamed answer |
//! | `nexus chat` | Interactive chat loop |
//! | `nexus audit <files>` | Staged review of the given documents |
//! | `nexus compare <a> <b>` | Redline comparison of two documents |
//! | `nexus sessions list` | List saved sessions |
//! | `nexus reports list` | List saved reports |
//! | `nexus reset` | Clear a session's history and index |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest a contract into the default session
//! nexus ingest contract.pdf
//!
//! # Ask with retrieval and live web context
//! nexus ask "what is the refund policy?" --web
//!
//! # Ask about an image instead of the index
//! nexus ask "what is shown here?" --image diagram.png
//!
//! # Staged review focused on one topic
//! nexus audit contract.pdf --focus "termination clauses"
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use nexus::chunk;
use nexus::completion::{CancelToken, ChatBackend, CompletionClient};
use nexus::config::{self, Config};
use nexus::embedding::{self, EmbeddingProvider};
use nexus::index::VectorIndex;
use nexus::ingest::{self, ExtractedDocument};
use nexus::session::{ReportRecord, SessionStore};
use nexus::stages;
use nexus::turn::{self, ImageAttachment, TurnInput, TurnOptions, TurnPhase};

/// Nexus — a retrieval-augmented document chat pipeline for hosted
/// language models.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file; a missing file falls back to built-in defaults.
#[derive(Parser)]
#[command(
    name = "nexus",
    about = "Nexus — chat with your documents through a hosted language model",
    version,
    long_about = "Nexus ingests documents (PDF, DOCX, text, images), chunks and embeds \
    them into a per-session vector index, and answers questions with a streamed, \
    retrieval-grounded response. Sessions, index snapshots, and review reports are \
    persisted under the configured data directory."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nexus.toml")]
    config: PathBuf,

    /// Session id. Every session has its own history and index namespace.
    #[arg(long, global = true, default_value = "default")]
    session: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the data directories and write a starter config.
    ///
    /// Idempotent; an existing config file is left untouched.
    Init,

    /// Ingest documents into the session's index.
    ///
    /// Extracts text (PDF per page, DOCX paragraphs, UTF-8 text), chunks
    /// it with overlap, embeds the chunks, and updates the session's
    /// vector index snapshot. Unreadable files are skipped with a
    /// warning; the rest of the batch continues.
    Ingest {
        /// Files or directories to ingest.
        paths: Vec<PathBuf>,

        /// Glob patterns applied to directory entries (e.g. "**/*.pdf").
        #[arg(long = "include")]
        include: Vec<String>,

        /// Show file and chunk counts without embedding or writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask one question and stream the answer.
    ///
    /// Retrieval runs against the session index when it has content;
    /// failures of retrieval or web search downgrade the turn instead of
    /// failing it. Press Ctrl-C to cancel the in-flight turn.
    Ask {
        /// The question text.
        question: String,

        /// Also fetch live web snippets for the query.
        #[arg(long)]
        web: bool,

        /// Skip document retrieval for this turn.
        #[arg(long)]
        no_retrieval: bool,

        /// Attach an image; the turn goes to the vision path and
        /// retrieval is skipped.
        #[arg(long)]
        image: Option<PathBuf>,
    },

    /// Interactive chat loop. Type `exit` to leave.
    Chat {
        /// Fetch live web snippets for every turn.
        #[arg(long)]
        web: bool,
    },

    /// Run the staged review pipeline over the given documents.
    ///
    /// Summarize → spot issues → final report, each stage one completion
    /// call fed by the previous stage's output. The report is saved
    /// under the data directory.
    Audit {
        /// Documents to review.
        paths: Vec<PathBuf>,

        /// Narrow the review to a particular concern.
        #[arg(long)]
        focus: Option<String>,
    },

    /// Compare two documents and report what changed.
    Compare {
        /// Reference document.
        a: PathBuf,
        /// Document to compare against the reference.
        b: PathBuf,
    },

    /// Manage saved sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage saved audit/compare reports.
    Reports {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// Clear the session's history and index. The session id remains
    /// usable afterwards.
    Reset,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List saved sessions, most recent first.
    List,
    /// Print a session's transcript.
    Show {
        /// Session id.
        id: String,
    },
    /// Delete a session's transcript and index snapshot.
    Delete {
        /// Session id.
        id: String,
    },
}

#[derive(Subcommand)]
enum ReportAction {
    /// List saved reports, newest first.
    List,
    /// Print a report body.
    Show {
        /// Report id (e.g. AUD-3f2a).
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let store = SessionStore::new(cfg.storage.data_dir.clone());

    match cli.command {
        Commands::Init => {
            store.init()?;
            if cli.config.exists() {
                println!("config already present: {}", cli.config.display());
            } else {
                if let Some(parent) = cli.config.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&cli.config, config::starter_config_toml())?;
                println!("wrote starter config: {}", cli.config.display());
            }
            println!("data directory ready: {}", cfg.storage.data_dir.display());
        }
        Commands::Ingest {
            paths,
            include,
            dry_run,
        } => {
            run_ingest(&cfg, &store, &cli.session, &paths, &include, dry_run).await?;
        }
        Commands::Ask {
            question,
            web,
            no_retrieval,
            image,
        } => {
            run_ask(&cfg, &store, &cli.session, &question, web, no_retrieval, image).await?;
        }
        Commands::Chat { web } => {
            run_chat(&cfg, &store, &cli.session, web).await?;
        }
        Commands::Audit { paths, focus } => {
            run_audit(&cfg, &store, &paths, focus.as_deref()).await?;
        }
        Commands::Compare { a, b } => {
            run_compare(&cfg, &store, &a, &b).await?;
        }
        Commands::Sessions { action } => match action {
            SessionAction::List => {
                let sessions = store.list()?;
                if sessions.is_empty() {
                    println!("No saved sessions.");
                } else {
                    println!("{:<20} {:<22} {:>6} {:>6}", "SESSION", "SAVED", "DOCS", "TURNS");
                    for s in sessions {
                        println!(
                            "{:<20} {:<22} {:>6} {:>6}",
                            s.id,
                            s.saved_at.format("%Y-%m-%d %H:%M:%S"),
                            s.documents,
                            s.turns
                        );
                    }
                }
            }
            SessionAction::Show { id } => {
                let session = store.load(&id).await?;
                println!("session {}", session.id);
                println!("  created: {}", session.created_at.format("%Y-%m-%d %H:%M:%S"));
                if !session.documents.is_empty() {
                    println!("  documents: {}", session.documents.join(", "));
                }
                println!();
                for t in &session.history {
                    println!(
                        "[{}] {}:",
                        t.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        t.role.as_str()
                    );
                    println!("{}", t.content);
                    println!();
                }
            }
            SessionAction::Delete { id } => {
                store.delete(&id)?;
                println!("deleted session {}", id);
            }
        },
        Commands::Reports { action } => match action {
            ReportAction::List => {
                let reports = store.list_reports()?;
                if reports.is_empty() {
                    println!("No saved reports.");
                } else {
                    println!("{:<10} {:<8} {:<22} TITLE", "REPORT", "KIND", "CREATED");
                    for r in reports {
                        println!(
                            "{:<10} {:<8} {:<22} {}",
                            r.id,
                            r.kind,
                            r.created_at.format("%Y-%m-%d %H:%M:%S"),
                            r.title
                        );
                    }
                }
            }
            ReportAction::Show { id } => {
                let report = store.load_report(&id)?;
                println!("{} — {} ({})", report.id, report.title, report.kind);
                println!();
                println!("{}", report.body);
            }
        },
        Commands::Reset => {
            let mut session = store.load(&cli.session).await?;
            store.reset(&mut session)?;
            println!("reset session {}", cli.session);
        }
    }

    Ok(())
}

async fn run_ingest(
    cfg: &Config,
    store: &SessionStore,
    session_id: &str,
    paths: &[PathBuf],
    include: &[String],
    dry_run: bool,
) -> Result<()> {
    if paths.is_empty() {
        bail!("nothing to ingest: pass one or more files or directories");
    }

    let files = ingest::collect_files(paths, include)?;
    let (docs, unreadable) = ingest::load_documents(&files);
    for (name, reason) in &unreadable {
        eprintln!("Warning: skipping {}: {}", name, reason);
    }

    let batch = ingest::extract_batch(&docs);
    for (name, reason) in &batch.skipped {
        eprintln!("Warning: skipping {}: {}", name, reason);
    }

    let mut all_chunks = Vec::new();
    let mut visual_files = 0usize;
    let mut text_files: Vec<String> = Vec::new();
    for (name, extracted) in &batch.extracted {
        match extracted {
            ExtractedDocument::Pages(pages) => {
                let chunks = chunk::chunk_pages(name, pages, &cfg.chunking);
                if chunks.is_empty() {
                    eprintln!("Warning: {} produced no extractable text", name);
                    continue;
                }
                text_files.push(name.clone());
                all_chunks.extend(chunks);
            }
            ExtractedDocument::Image { .. } => {
                // Not indexed: image files are analyzed per-turn via --image.
                visual_files += 1;
                eprintln!(
                    "Note: {} is an image; attach it to a question with --image",
                    name
                );
            }
        }
    }

    if dry_run {
        println!("ingest {} (dry-run)", session_id);
        println!("  files found: {}", files.len());
        println!("  text documents: {}", text_files.len());
        println!("  estimated chunks: {}", all_chunks.len());
        return Ok(());
    }

    if all_chunks.is_empty() {
        println!("ingest {}", session_id);
        println!("  no indexable text found");
        return Ok(());
    }

    let provider = embedding::create_provider(&cfg.embedding)?;
    let mut session = store.load(session_id).await?;

    let mut index = match session.index.take() {
        Some(ix) => {
            if ix.model() != provider.model_name() || ix.dims() != provider.dims() {
                bail!(
                    "session index was built with '{}' ({} dims) but the configured \
                     embedding model is '{}' ({} dims); run `nexus reset` to re-embed",
                    ix.model(),
                    ix.dims(),
                    provider.model_name(),
                    provider.dims()
                );
            }
            ix
        }
        None => VectorIndex::new(provider.model_name(), provider.dims()),
    };

    let total_chunks = all_chunks.len();
    let (embedded, failed) =
        embedding::embed_chunks(provider.as_ref(), cfg.embedding.batch_size, all_chunks).await;
    let embedded_count = embedded.len();

    let (chunks, vectors): (Vec<_>, Vec<_>) = embedded.into_iter().unzip();
    index.insert_batch(chunks, vectors)?;
    session.index = Some(index);
    for name in &text_files {
        session.record_document(name);
    }

    store.persist_index(&session).await?;
    store.save_transcript(&session)?;

    println!("ingest {}", session_id);
    println!("  files found: {}", files.len());
    println!(
        "  skipped: {}",
        unreadable.len() + batch.skipped.len() + visual_files
    );
    println!("  chunks: {}", total_chunks);
    println!("  embedded: {}", embedded_count);
    if failed > 0 {
        println!("  embedding failures: {}", failed);
    }
    println!(
        "  index size: {} chunks",
        session.index.as_ref().map(|ix| ix.len()).unwrap_or(0)
    );
    println!("ok");
    Ok(())
}

/// Build the embedding provider for query-time retrieval. A provider
/// that cannot be constructed downgrades retrieval instead of failing
/// the turn.
fn query_embedder(cfg: &Config) -> Option<Box<dyn EmbeddingProvider>> {
    if !cfg.embedding.is_enabled() {
        return None;
    }
    match embedding::create_provider(&cfg.embedding) {
        Ok(provider) => Some(provider),
        Err(e) => {
            eprintln!("Warning: retrieval unavailable: {}", e);
            None
        }
    }
}

/// Wire Ctrl-C to the turn's cancellation token.
fn spawn_cancel_listener(cancel: &CancelToken) -> tokio::task::JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    })
}

async fn run_ask(
    cfg: &Config,
    store: &SessionStore,
    session_id: &str,
    question: &str,
    web: bool,
    no_retrieval: bool,
    image: Option<PathBuf>,
) -> Result<()> {
    let mut session = store.load(session_id).await?;
    let backend = CompletionClient::new(&cfg.completion)?;
    let embedder = query_embedder(cfg);

    let attachment = match image {
        Some(ref path) => {
            let (media_type, bytes) = ingest::load_image_attachment(path)?;
            Some(ImageAttachment { media_type, bytes })
        }
        None => None,
    };

    let input = TurnInput {
        text: question.to_string(),
        image: attachment,
    };
    let opts = TurnOptions {
        retrieval: !no_retrieval,
        web_search: web,
    };

    let cancel = CancelToken::new();
    let listener = spawn_cancel_listener(&cancel);

    let mut stdout = std::io::stdout();
    let report = turn::run_turn(
        &mut session,
        cfg,
        &backend,
        embedder.as_deref(),
        input,
        &opts,
        &cancel,
        &mut |token: &str| {
            let _ = write!(stdout, "{}", token);
            let _ = stdout.flush();
        },
    )
    .await;
    listener.abort();
    println!();

    for warning in &report.warnings {
        eprintln!("Warning: {}", warning);
    }

    store.save_transcript(&session)?;

    match report.phase {
        TurnPhase::Cancelled => {
            eprintln!("turn cancelled");
        }
        TurnPhase::Failed => {
            bail!(
                "completion failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        _ => {}
    }

    Ok(())
}

async fn run_chat(cfg: &Config, store: &SessionStore, session_id: &str, web: bool) -> Result<()> {
    let mut session = store.load(session_id).await?;
    let backend = CompletionClient::new(&cfg.completion)?;
    let embedder = query_embedder(cfg);
    let interactive = atty::is(atty::Stream::Stdout);

    if interactive {
        println!("session {} — type 'exit' to leave", session_id);
        if let Some(index) = session.index.as_ref().filter(|ix| !ix.is_empty()) {
            println!(
                "  {} chunks indexed from: {}",
                index.len(),
                index.source_names().join(", ")
            );
        }
    }

    let stdin = std::io::stdin();
    loop {
        if interactive {
            print!("you> ");
            std::io::stdout().flush()?;
        }

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }

        let opts = TurnOptions {
            retrieval: true,
            web_search: web,
        };
        let cancel = CancelToken::new();
        let listener = spawn_cancel_listener(&cancel);

        let mut stdout = std::io::stdout();
        let report = turn::run_turn(
            &mut session,
            cfg,
            &backend,
            embedder.as_deref(),
            TurnInput::text_only(question),
            &opts,
            &cancel,
            &mut |token: &str| {
                let _ = write!(stdout, "{}", token);
                let _ = stdout.flush();
            },
        )
        .await;
        listener.abort();
        println!();

        for warning in &report.warnings {
            eprintln!("Warning: {}", warning);
        }
        match report.phase {
            TurnPhase::Cancelled => eprintln!("turn cancelled"),
            TurnPhase::Failed => eprintln!(
                "Error: completion failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            ),
            _ => {}
        }

        // The session survives any single turn's failure.
        store.save_transcript(&session)?;
    }

    store.save_transcript(&session)?;
    Ok(())
}

/// Extract and concatenate the text of review inputs.
fn review_text(paths: &[PathBuf]) -> Result<(Vec<String>, String)> {
    let files = ingest::collect_files(paths, &[])?;
    let (docs, unreadable) = ingest::load_documents(&files);
    for (name, reason) in &unreadable {
        eprintln!("Warning: skipping {}: {}", name, reason);
    }
    let batch = ingest::extract_batch(&docs);
    for (name, reason) in &batch.skipped {
        eprintln!("Warning: skipping {}: {}", name, reason);
    }

    let mut names = Vec::new();
    let mut text = String::new();
    for (name, extracted) in &batch.extracted {
        if let ExtractedDocument::Pages(pages) = extracted {
            names.push(name.clone());
            for page in pages {
                text.push_str(&page.text);
                text.push_str("\n\n");
            }
        }
    }
    Ok((names, text))
}

async fn run_audit(
    cfg: &Config,
    store: &SessionStore,
    paths: &[PathBuf],
    focus: Option<&str>,
) -> Result<()> {
    if paths.is_empty() {
        bail!("nothing to audit: pass one or more documents");
    }
    let (names, text) = review_text(paths)?;
    if text.trim().is_empty() {
        bail!("no extractable text in the given documents");
    }

    let backend = CompletionClient::new(&cfg.completion)?;
    let specs = stages::audit_stages(focus);
    let outputs = stages::run_stages(&backend, &specs, stages::bounded_stage_input(&text)).await?;

    for output in &outputs {
        println!("== {} ==", output.name);
        println!("{}", output.output);
        println!();
    }

    let final_report = outputs
        .last()
        .map(|o| o.output.clone())
        .context("audit produced no output")?;
    let report = ReportRecord::new("audit", names.join(", "), final_report);
    store.save_report(&report)?;
    println!("saved report {}", report.id);
    Ok(())
}

async fn run_compare(
    cfg: &Config,
    store: &SessionStore,
    a: &PathBuf,
    b: &PathBuf,
) -> Result<()> {
    let (a_names, a_text) = review_text(std::slice::from_ref(a))?;
    let (b_names, b_text) = review_text(std::slice::from_ref(b))?;
    if a_text.trim().is_empty() || b_text.trim().is_empty() {
        bail!("both documents must contain extractable text");
    }
    let a_name = a_names.first().cloned().unwrap_or_else(|| a.display().to_string());
    let b_name = b_names.first().cloned().unwrap_or_else(|| b.display().to_string());

    let backend = CompletionClient::new(&cfg.completion)?;
    let messages = stages::compare_messages(&a_name, &a_text, &b_name, &b_text);
    let result = backend.complete(&messages).await?;

    println!("{}", result);

    let report = ReportRecord::new("compare", format!("{} vs {}", a_name, b_name), result);
    store.save_report(&report)?;
    println!("saved report {}", report.id);
    Ok(())
}
