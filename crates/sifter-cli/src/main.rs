use std::fs;
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use sifter_contracts::chat::{parse_intent, render_transcript, ChatMessage, CHAT_HELP_COMMANDS};
use sifter_contracts::data_uri::{self, looks_like_data_uri, GIF_MIME, PNG_MIME};
use sifter_contracts::events::EventWriter;
use sifter_contracts::receipts::{build_receipt, write_receipt};
use sifter_contracts::{ColorSpec, ColorSubstitutionRule, Rectangle};
use sifter_engine::media::{extract_media_urls, fetch_media};
use sifter_engine::{
    DetectorConfig, EditConfig, EditOperation, EditOutcome, EditRequest, GifEditPipeline,
    RegionRequest,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "SIFTER_LOG";
const STDOUT_MARKER: &str = "-";

#[derive(Debug, Parser)]
#[command(name = "sifter", version, about = "Region editor for animated GIFs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Paint an opaque box over a region of every frame.
    Replace(ReplaceArgs),
    /// Make a region fully transparent, keeping its colour channels.
    Cutout(RectArgs),
    /// Erase a region to transparent black.
    Punch(RectArgs),
    /// Keep only a region of every frame.
    Crop(RectArgs),
    /// Swap one colour for another across every frame.
    Recolor(RecolorArgs),
    /// Locate a described region with a detector and replace it.
    Detect(DetectArgs),
    /// Locate the most prominent logo or watermark and replace it.
    Auto(AutoArgs),
    /// Agree on a region in conversation, then replace it.
    Chat(ChatArgs),
    /// Write the first frame as PNG.
    Preview(PreviewArgs),
    /// List image URLs found in a CSV file.
    Urls(UrlsArgs),
    /// Download one media URL.
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// JSONL event log.
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    detector: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Receipt JSON written after a successful edit.
    #[arg(long)]
    receipt: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct IoArgs {
    /// GIF path or data URI.
    #[arg(long)]
    input: String,
    /// Output path, or `-` to print a data URI.
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Parser)]
struct RectArgs {
    #[command(flatten)]
    io: IoArgs,
    /// x,y,width,height in frame pixels.
    #[arg(long)]
    rect: Rectangle,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct ReplaceArgs {
    #[command(flatten)]
    target: RectArgs,
    /// r,g,b or #rrggbb; defaults to white.
    #[arg(long)]
    fill: Option<ColorSpec>,
}

#[derive(Debug, Parser)]
struct RecolorArgs {
    #[command(flatten)]
    io: IoArgs,
    #[arg(long)]
    source: ColorSpec,
    #[arg(long)]
    target: ColorSpec,
    /// Perceptual distance below which a pixel counts as the source colour.
    #[arg(long, default_value_t = 20.0)]
    tolerance: f64,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct DetectArgs {
    #[command(flatten)]
    io: IoArgs,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    fill: Option<ColorSpec>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct AutoArgs {
    #[command(flatten)]
    io: IoArgs,
    #[arg(long)]
    fill: Option<ColorSpec>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    input: String,
    #[arg(long)]
    out_dir: PathBuf,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct PreviewArgs {
    #[command(flatten)]
    io: IoArgs,
}

#[derive(Debug, Parser)]
struct UrlsArgs {
    #[arg(long)]
    csv: PathBuf,
}

#[derive(Debug, Parser)]
struct FetchArgs {
    #[arg(long)]
    url: String,
    #[arg(long)]
    output: PathBuf,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("sifter error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Replace(args) => run_edit(
            &args.target.io,
            &args.target.common,
            EditRequest::direct(EditOperation::Replace { fill: args.fill }, args.target.rect),
        ),
        Command::Cutout(args) => run_rect(args, EditOperation::Cutout),
        Command::Punch(args) => run_rect(args, EditOperation::Punch),
        Command::Crop(args) => run_rect(args, EditOperation::Crop),
        Command::Recolor(args) => {
            let rule = ColorSubstitutionRule::new(args.source, args.target, args.tolerance)?;
            run_edit(
                &args.io,
                &args.common,
                EditRequest::new(EditOperation::Recolor(rule), None),
            )
        }
        Command::Detect(args) => run_edit(
            &args.io,
            &args.common,
            EditRequest::new(
                EditOperation::Replace { fill: args.fill },
                Some(RegionRequest::Prompted {
                    prompt: args.prompt.trim().to_string(),
                }),
            ),
        ),
        Command::Auto(args) => run_edit(
            &args.io,
            &args.common,
            EditRequest::new(
                EditOperation::Replace { fill: args.fill },
                Some(RegionRequest::Automatic),
            ),
        ),
        Command::Chat(args) => run_chat(args),
        Command::Preview(args) => run_preview(args),
        Command::Urls(args) => run_urls(args),
        Command::Fetch(args) => run_fetch(args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn build_pipeline(common: &CommonArgs) -> Result<GifEditPipeline> {
    let config = EditConfig::from_env()?;
    let mut pipeline = GifEditPipeline::new(config, &DetectorConfig::from_env());
    if let Some(path) = &common.events {
        pipeline = pipeline.with_events(EventWriter::new(path, "sifter-cli"));
    }
    if let Some(detector) = &common.detector {
        pipeline.set_detector(detector)?;
    }
    pipeline.set_model(common.model.clone());
    Ok(pipeline)
}

fn run_rect(args: RectArgs, operation: EditOperation) -> Result<()> {
    run_edit(
        &args.io,
        &args.common,
        EditRequest::direct(operation, args.rect),
    )
}

fn run_edit(io_args: &IoArgs, common: &CommonArgs, request: EditRequest) -> Result<()> {
    let pipeline = build_pipeline(common)?;
    let input = load_input(&io_args.input)?;
    let outcome = pipeline.edit(&input, &request)?;
    write_output(&io_args.output, &outcome.data_uri)?;

    if let Some(receipt_path) = &common.receipt {
        let input_path = input_path(&io_args.input);
        write_edit_receipt(
            receipt_path,
            &request,
            &outcome,
            input_path.as_deref(),
            &io_args.output,
        )?;
    }
    eprintln!("{}", outcome_summary(&outcome));
    Ok(())
}

fn write_edit_receipt(
    path: &Path,
    request: &EditRequest,
    outcome: &EditOutcome,
    input_path: Option<&Path>,
    output_path: &Path,
) -> Result<()> {
    let mut record = request.record();
    record.detector = outcome.detector.clone();
    record.model = outcome.model.clone();
    let mut warnings = Vec::new();
    if let Some(reason) = &outcome.fallback_reason {
        warnings.push(reason.clone());
    }
    if outcome.passthrough {
        warnings.push("no region selected; output is the unmodified input".to_string());
    }
    let output_path = (output_path != Path::new(STDOUT_MARKER)).then_some(output_path);
    let receipt = build_receipt(
        &record,
        &outcome.result_record(),
        input_path,
        output_path,
        &warnings,
    );
    write_receipt(path, &receipt)
        .with_context(|| format!("failed to write receipt {}", path.display()))
}

fn outcome_summary(outcome: &EditOutcome) -> String {
    if outcome.passthrough {
        return "No region selected; input written unchanged.".to_string();
    }
    let dims = outcome
        .dims
        .map(|dims| dims.to_string())
        .unwrap_or_else(|| "?".to_string());
    let mut summary = format!(
        "Edited {} frame(s) at {dims} in {} ms",
        outcome.frame_count, outcome.elapsed_ms
    );
    if let Some(loop_count) = outcome.loop_count {
        summary.push_str(&format!(", loop {loop_count}"));
    }
    summary
}

fn run_preview(args: PreviewArgs) -> Result<()> {
    let pipeline = GifEditPipeline::new(EditConfig::from_env()?, &DetectorConfig::default());
    let input = load_input(&args.io.input)?;
    let preview = pipeline.preview_first_frame(&input)?;
    write_output(&args.io.output, &preview)
}

fn run_urls(args: UrlsArgs) -> Result<()> {
    let csv = fs::read_to_string(&args.csv)
        .with_context(|| format!("failed to read {}", args.csv.display()))?;
    let urls = extract_media_urls(&csv);
    debug!(count = urls.len(), "extracted media URLs");
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for url in urls {
        writeln!(out, "{url}")?;
    }
    Ok(())
}

fn run_fetch(args: FetchArgs) -> Result<()> {
    let timeout = DetectorConfig::from_env().request_timeout;
    let media = fetch_media(&args.url, timeout)?;
    write_output(&args.output, &media.to_data_uri())?;
    eprintln!("Fetched {} bytes ({})", media.bytes.len(), media.mime_type);
    Ok(())
}

fn run_chat(args: ChatArgs) -> Result<()> {
    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    let events_path = args
        .common
        .events
        .clone()
        .unwrap_or_else(|| args.out_dir.join("events.jsonl"));
    let pipeline =
        build_pipeline(&args.common)?.with_events(EventWriter::new(&events_path, "sifter-chat"));
    let mut session = ChatSession::new(load_input(&args.input)?, args.out_dir.clone());

    println!("Sifter chat started. Type /help for commands.");
    let stdin = io::stdin();
    let stdout = io::stdout();
    chat_loop(pipeline, &mut session, stdin.lock(), stdout.lock())
}

/// State of one interactive session. Each edit is kept for `/undo`.
struct ChatSession {
    current: String,
    history: Vec<ChatMessage>,
    undo: Vec<String>,
    edits: usize,
    out_dir: PathBuf,
}

impl ChatSession {
    fn new(current: String, out_dir: PathBuf) -> Self {
        Self {
            current,
            history: Vec::new(),
            undo: Vec::new(),
            edits: 0,
            out_dir,
        }
    }
}

fn chat_loop<R: BufRead, W: Write>(
    mut pipeline: GifEditPipeline,
    session: &mut ChatSession,
    mut input: R,
    mut out: W,
) -> Result<()> {
    let mut line = String::new();
    loop {
        write!(out, "> ")?;
        out.flush()?;

        line.clear();
        let read = match input.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        match intent.action.as_str() {
            "noop" => {}
            "help" => writeln!(out, "Commands: {}", CHAT_HELP_COMMANDS.join(" "))?,
            "set_detector" => {
                match value_as_non_empty_string(intent.command_args.get("detector")) {
                    Some(name) => match pipeline.set_detector(&name) {
                        Ok(()) => writeln!(out, "Detector set to {name}")?,
                        Err(err) => writeln!(out, "{err}")?,
                    },
                    None => writeln!(
                        out,
                        "Detector: {} (available: {})",
                        pipeline.detector(),
                        pipeline.detectors().join(", ")
                    )?,
                }
            }
            "set_model" => {
                let model = value_as_non_empty_string(intent.command_args.get("model"));
                pipeline.set_model(model);
                writeln!(
                    out,
                    "Model set to {}",
                    pipeline.model().unwrap_or("the detector default")
                )?;
            }
            "set_active_gif" => match value_as_non_empty_string(intent.command_args.get("path")) {
                Some(path) => match load_input(&path) {
                    Ok(uri) => {
                        session.current = uri;
                        session.history.clear();
                        session.undo.clear();
                        writeln!(out, "Active GIF set to {path}")?;
                    }
                    Err(err) => writeln!(out, "Could not load {path}: {err:#}")?,
                },
                None => writeln!(out, "/use requires a path")?,
            },
            "save" => match value_as_non_empty_string(intent.command_args.get("path")) {
                Some(path) => {
                    write_output(Path::new(&path), &session.current)?;
                    writeln!(out, "Saved {path}")?;
                }
                None => writeln!(out, "/save requires a path")?,
            },
            "preview" => {
                let path = value_as_non_empty_string(intent.command_args.get("path"))
                    .map(PathBuf::from)
                    .unwrap_or_else(|| session.out_dir.join("preview.png"));
                match pipeline.preview_first_frame(&session.current) {
                    Ok(png) => {
                        write_output(&path, &png)?;
                        writeln!(out, "Preview written to {}", path.display())?;
                    }
                    Err(err) => writeln!(out, "Preview failed: {err}")?,
                }
            }
            "reset" => {
                session.history.clear();
                writeln!(out, "Conversation cleared.")?;
            }
            "history" => {
                if session.history.is_empty() {
                    writeln!(out, "(no messages yet)")?;
                } else {
                    writeln!(out, "{}", render_transcript(&session.history))?;
                }
            }
            "undo" => match session.undo.pop() {
                Some(previous) => {
                    session.current = previous;
                    writeln!(out, "Reverted the last edit.")?;
                }
                None => writeln!(out, "Nothing to undo.")?,
            },
            "quit" => break,
            "message" => {
                let Some(message) = intent.message else {
                    continue;
                };
                chat_turn(&pipeline, session, message, &mut out)?;
            }
            _ => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                writeln!(out, "Unknown command /{command}. Type /help.")?;
            }
        }
    }
    Ok(())
}

fn chat_turn<W: Write>(
    pipeline: &GifEditPipeline,
    session: &mut ChatSession,
    message: String,
    out: &mut W,
) -> Result<()> {
    session.history.push(ChatMessage::user(message));
    let outcome = match pipeline.chat_and_replace(&session.current, &session.history) {
        Ok(outcome) => outcome,
        Err(err) => {
            session.history.pop();
            warn!(error = %err, "chat turn failed");
            writeln!(out, "Chat turn failed: {err}")?;
            return Ok(());
        }
    };
    writeln!(out, "{}", outcome.reply)?;
    session.history.push(ChatMessage::model(outcome.reply.clone()));

    if let Some(image) = outcome.image {
        session.edits += 1;
        let path = session
            .out_dir
            .join(format!("edit-{:03}.gif", session.edits));
        write_output(&path, &image)?;
        session
            .undo
            .push(std::mem::replace(&mut session.current, image));
        writeln!(out, "Saved {}", path.display())?;
    }
    Ok(())
}

/// Accepts a data URI as is, or reads a file and wraps it as one.
fn load_input(raw: &str) -> Result<String> {
    if looks_like_data_uri(raw) {
        return Ok(raw.trim().to_string());
    }
    let path = Path::new(raw.trim());
    let bytes =
        fs::read(path).with_context(|| format!("failed to read input {}", path.display()))?;
    Ok(data_uri::encode(&bytes, sniff_mime(path, &bytes)))
}

fn input_path(raw: &str) -> Option<PathBuf> {
    (!looks_like_data_uri(raw)).then(|| PathBuf::from(raw.trim()))
}

fn sniff_mime(path: &Path, bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return GIF_MIME;
    }
    if bytes.starts_with(b"\x89PNG") {
        return PNG_MIME;
    }
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("gif") => GIF_MIME,
        Some("png") => PNG_MIME,
        _ => "application/octet-stream",
    }
}

/// Writes the decoded bytes of `uri`, or the URI itself for `-`.
fn write_output(path: &Path, uri: &str) -> Result<()> {
    if path == Path::new(STDOUT_MARKER) {
        println!("{uri}");
        return Ok(());
    }
    let image = data_uri::decode(uri)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, &image.bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let raw = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}
