use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use easel_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use easel_contracts::gallery::{GeneratedImage, ImagePayload};
use easel_engine::config::default_data_dir;
use easel_engine::{
    resolve_payload_bytes, EaselConfig, GalleryView, GenerateError, GenerationResult,
    ImageGenerator, PendingSubmission, ResponseFormat, SubmitOutcome, SubmitState,
    DEFAULT_API_BASE, DEFAULT_MODEL,
};
use reqwest::blocking::Client as HttpClient;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Generate images from prompts and keep them in a local gallery")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Directory holding the gallery store and activity log.
    #[arg(long, global = true, env = "EASEL_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Store file written by an earlier version, imported when the gallery is empty.
    #[arg(long, global = true)]
    legacy_store: Option<PathBuf>,
    #[arg(long, global = true, default_value = "openai")]
    provider: String,
    #[arg(long, global = true, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long, global = true, default_value = "b64_json")]
    response_format: ResponseFormat,
    #[arg(long, global = true, env = "OPENAI_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,
    /// Storage quota in bytes (keys plus values).
    #[arg(long, global = true)]
    capacity_bytes: Option<usize>,
    /// Keep everything in memory; nothing is read from or written to disk.
    #[arg(long, global = true)]
    ephemeral: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session: type a prompt to generate, /help for commands.
    Chat,
    Generate(GenerateArgs),
    List,
    Show(TargetArgs),
    Delete(TargetArgs),
    Save(SaveArgs),
    /// Show the stored API key (masked) or replace it.
    Key(KeyArgs),
    /// List recovery slots, or print one.
    Recovery(RecoveryArgs),
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    /// Stored for later runs, like typing it into the key field.
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// 1-based gallery position or id prefix.
    target: String,
}

#[derive(Debug, Args)]
struct SaveArgs {
    target: String,
    path: PathBuf,
}

#[derive(Debug, Args)]
struct KeyArgs {
    value: Option<String>,
}

#[derive(Debug, Args)]
struct RecoveryArgs {
    key: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing();
    let config = resolve_config(&cli.global);
    tracing::debug!(
        provider = %config.provider,
        storage = ?config.storage_path(),
        activity = ?config.activity_path(),
        "resolved configuration"
    );
    match cli.command {
        Command::Chat => {
            run_chat(&config)?;
            Ok(0)
        }
        Command::Generate(args) => run_generate(&config, args),
        Command::List => {
            let view = config.open_view();
            print_notice(&view);
            print_gallery(&view);
            Ok(0)
        }
        Command::Show(args) => {
            let view = config.open_view();
            print_notice(&view);
            let id = resolve_in_view(&view, &args.target)?;
            if let Some(image) = view.get(&id) {
                print_image(view.position(&id).unwrap_or_default(), image);
            }
            Ok(0)
        }
        Command::Delete(args) => {
            let mut view = config.open_view();
            print_notice(&view);
            let id = resolve_in_view(&view, &args.target)?;
            match view.delete(&id) {
                Ok(_) => {
                    println!("Deleted {}", short_id(&id));
                    Ok(0)
                }
                Err(notice) => {
                    eprintln!("{notice}");
                    Ok(1)
                }
            }
        }
        Command::Save(args) => {
            let view = config.open_view();
            let id = resolve_in_view(&view, &args.target)?;
            let path = save_image(&view, &id, &args.path)?;
            println!("Saved {}", path.display());
            Ok(0)
        }
        Command::Key(args) => {
            let mut state = config.open_state();
            match args.value {
                Some(value) => {
                    state.save_api_key(&value)?;
                    println!("API key set to {}", mask_key(&value));
                }
                None => {
                    let key = state.load_api_key();
                    if key.trim().is_empty() {
                        println!("No API key stored.");
                    } else {
                        println!("{}", mask_key(&key));
                    }
                }
            }
            Ok(0)
        }
        Command::Recovery(args) => {
            let state = config.open_state();
            match args.key {
                Some(key) => match state.recovery_value(&key)? {
                    Some(value) => println!("{value}"),
                    None => bail!("no recovery slot named '{key}'"),
                },
                None => {
                    let keys = state.recovery_keys()?;
                    if keys.is_empty() {
                        println!("No recovery slots.");
                    }
                    for key in keys {
                        println!("{key}");
                    }
                }
            }
            Ok(0)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn resolve_config(args: &GlobalArgs) -> EaselConfig {
    let data_dir = if args.ephemeral {
        None
    } else {
        Some(
            args.data_dir
                .clone()
                .unwrap_or_else(|| default_data_dir(dirs::data_dir().as_deref())),
        )
    };
    EaselConfig {
        data_dir,
        legacy_store: args.legacy_store.clone(),
        provider: args.provider.trim().to_ascii_lowercase(),
        model: args.model.clone(),
        response_format: args.response_format,
        api_base: args.api_base.clone(),
        capacity_bytes: args.capacity_bytes,
    }
}

fn run_generate(config: &EaselConfig, args: GenerateArgs) -> Result<i32> {
    let generator = config.generator()?;
    let mut view = config.open_view();
    if let Some(key) = args.api_key.as_deref() {
        view.set_api_key(key);
    }
    view.set_prompt(&args.prompt);
    if let Some(reason) = submit_blocker(&view) {
        bail!("{reason}");
    }

    let Some(outcome) = view.submit_with(generator.as_ref()) else {
        bail!("submission did not start");
    };
    match outcome {
        SubmitOutcome::Created { id } => {
            if let Some(image) = view.get(&id) {
                print_image(view.position(&id).unwrap_or_default(), image);
            }
            Ok(0)
        }
        _ => {
            if let Some(notice) = view.notice() {
                eprintln!("{notice}");
            }
            Ok(1)
        }
    }
}

type Finished = Result<GenerationResult, GenerateError>;

fn run_chat(config: &EaselConfig) -> Result<()> {
    let generator: Arc<dyn ImageGenerator> = Arc::from(config.generator()?);
    let mut view = config.open_view();
    let (tx, rx) = mpsc::channel::<Finished>();
    let mut in_flight: Option<PendingSubmission> = None;

    println!("Easel chat started ({} images). Type a prompt, or /help for commands.", view.len());
    print_notice(&view);

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        apply_finished(&mut view, &mut in_flight, &rx, false);

        print!("> ");
        io::stdout().flush()?;
        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        apply_finished(&mut view, &mut in_flight, &rx, false);

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        match intent.action.as_str() {
            "noop" => {}
            "help" => println!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")),
            "quit" => break,
            "generate" => {
                view.set_prompt(intent.prompt.as_deref().unwrap_or_default());
                if let Some(reason) = submit_blocker(&view) {
                    println!("{reason}");
                    continue;
                }
                let Some(pending) = view.begin_submit() else {
                    continue;
                };
                let worker = Arc::clone(&generator);
                let request = pending.request.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let _ = tx.send(worker.generate(&request));
                });
                in_flight = Some(pending);
                println!("Generating with {}... (/wait to block until done)", view.model());
            }
            "wait" => {
                if in_flight.is_none() {
                    println!("Nothing in progress.");
                } else {
                    apply_finished(&mut view, &mut in_flight, &rx, true);
                }
            }
            "set_api_key" => {
                let value = intent.arg("value").unwrap_or_default();
                view.set_api_key(value);
                if value.is_empty() {
                    println!("API key cleared.");
                } else {
                    println!("API key set to {}", mask_key(value));
                }
            }
            "list_images" => print_gallery(&view),
            "select_image" => {
                let Some(id) = chat_target(&view, intent.arg("target")) else {
                    continue;
                };
                view.select(&id);
                if let Some(image) = view.get(&id) {
                    print_image(view.position(&id).unwrap_or_default(), image);
                }
            }
            "show_prompt" => {
                let image = match intent.arg("target") {
                    Some(target) => chat_target(&view, Some(target)).and_then(|id| view.get(&id)),
                    None => {
                        if view.main_image().is_none() {
                            println!("No image selected. Use /show <n|id> first.");
                        }
                        view.main_image()
                    }
                };
                if let Some(image) = image {
                    println!("Original prompt: {}", image.original_prompt);
                    println!("Revised prompt:  {}", image.revised_prompt);
                }
            }
            "delete_image" => {
                let Some(id) = chat_target(&view, intent.arg("target")) else {
                    continue;
                };
                match view.delete(&id) {
                    Ok(_) => println!("Deleted {}", short_id(&id)),
                    Err(notice) => println!("! {notice}"),
                }
            }
            "save_image" => {
                let Some(id) = chat_target(&view, intent.arg("target")) else {
                    continue;
                };
                let Some(path) = intent.arg("path") else {
                    println!("/save requires a path");
                    continue;
                };
                match save_image(&view, &id, Path::new(path)) {
                    Ok(path) => println!("Saved {}", path.display()),
                    Err(err) => println!("Save failed: {err:#}"),
                }
            }
            "status" => print_status(&view),
            "dismiss_notice" => view.dismiss_notice(),
            "unknown" => {
                let command = intent.arg("command").unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
            }
            other => println!("Unhandled action: {other}"),
        }
    }

    if in_flight.is_some() {
        println!("Discarding the request still in progress.");
    }
    Ok(())
}

/// Applies a finished background request to the view, if one is ready.
fn apply_finished(
    view: &mut GalleryView,
    in_flight: &mut Option<PendingSubmission>,
    rx: &Receiver<Finished>,
    block: bool,
) {
    let Some(pending) = in_flight.take() else {
        return;
    };
    let result = if block {
        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(GenerateError::Service {
                status: None,
                message: "generation worker stopped unexpectedly".to_string(),
            }),
        }
    } else {
        match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => {
                *in_flight = Some(pending);
                return;
            }
            Err(TryRecvError::Disconnected) => Err(GenerateError::Service {
                status: None,
                message: "generation worker stopped unexpectedly".to_string(),
            }),
        }
    };

    match view.finish_submit(&pending, result) {
        SubmitOutcome::Created { id } => {
            if let Some(image) = view.get(&id) {
                println!("Done.");
                print_image(view.position(&id).unwrap_or_default(), image);
            }
        }
        SubmitOutcome::Ignored => {}
        SubmitOutcome::Failed { .. } | SubmitOutcome::NotPersisted { .. } => print_notice(view),
    }
}

fn submit_blocker(view: &GalleryView) -> Option<&'static str> {
    if view.is_loading() {
        return Some("A request is already in progress. Use /wait.");
    }
    if view.api_key().trim().is_empty() {
        return Some("No API key set. Use `easel key <value>`, --api-key, or /key in chat.");
    }
    if view.prompt().trim().is_empty() {
        return Some("Prompt is empty.");
    }
    None
}

fn chat_target(view: &GalleryView, target: Option<&str>) -> Option<String> {
    let Some(target) = target else {
        println!("A gallery position or id prefix is required.");
        return None;
    };
    match resolve_in_view(view, target) {
        Ok(id) => Some(id),
        Err(err) => {
            println!("{err:#}");
            None
        }
    }
}

fn resolve_in_view(view: &GalleryView, target: &str) -> Result<String> {
    let ids = view.images().map(|image| image.id.as_str()).collect::<Vec<&str>>();
    match resolve_target(&ids, target) {
        Ok(id) => Ok(id.to_string()),
        Err(message) => bail!(message),
    }
}

/// A 1-based position, or a unique id prefix.
fn resolve_target<'a>(ids: &[&'a str], target: &str) -> std::result::Result<&'a str, String> {
    let target = target.trim();
    if target.is_empty() {
        return Err("empty gallery target".to_string());
    }
    if let Ok(position) = target.parse::<usize>() {
        if let Some(id) = position.checked_sub(1).and_then(|index| ids.get(index).copied()) {
            return Ok(id);
        }
        if !ids.iter().any(|id| id.starts_with(target)) {
            return Err(format!(
                "no image at position {position} (gallery has {})",
                ids.len()
            ));
        }
    }
    let matches = ids
        .iter()
        .copied()
        .filter(|id| id.starts_with(target))
        .collect::<Vec<&str>>();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(format!("no image matches '{target}'")),
        _ => Err(format!(
            "'{target}' matches {} images; use a longer prefix",
            matches.len()
        )),
    }
}

fn save_image(view: &GalleryView, id: &str, path: &Path) -> Result<PathBuf> {
    let Some(image) = view.get(id) else {
        bail!("no image with id {id}");
    };
    let http = HttpClient::new();
    let bytes = resolve_payload_bytes(&http, &image.payload)?;
    let out = output_path(path, id, bytes.extension());
    if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(&out, &bytes.bytes).with_context(|| format!("failed writing {}", out.display()))?;
    Ok(out)
}

/// Directories get `<id>.<ext>` appended; anything else is used as given.
fn output_path(path: &Path, id: &str, extension: &str) -> PathBuf {
    if path.is_dir() {
        path.join(format!("{id}.{extension}"))
    } else {
        path.to_path_buf()
    }
}

fn print_notice(view: &GalleryView) {
    if let Some(notice) = view.notice() {
        println!("! {notice}");
    }
}

fn print_gallery(view: &GalleryView) {
    if view.is_empty() {
        println!("Gallery is empty.");
        return;
    }
    let main_id = view.main_image().map(|image| image.id.as_str());
    for (index, image) in view.images().enumerate() {
        let marker = if Some(image.id.as_str()) == main_id { '*' } else { ' ' };
        println!(
            "{marker}{:>3}. {}  {}",
            index + 1,
            short_id(&image.id),
            clip(&image.revised_prompt, 72)
        );
    }
}

fn print_image(position: usize, image: &GeneratedImage) {
    println!("#{position} {}", image.id);
    println!("  image:    {}", payload_summary(&image.payload));
    println!("  prompt:   {}", image.original_prompt);
    println!("  revised:  {}", image.revised_prompt);
}

fn print_status(view: &GalleryView) {
    let state = match view.state() {
        SubmitState::Idle => "idle".to_string(),
        SubmitState::Submitting { ticket } => format!("generating (request #{ticket})"),
    };
    println!("State:   {state}");
    println!("Model:   {}", view.model());
    let key = if view.api_key().trim().is_empty() {
        "(none)".to_string()
    } else {
        mask_key(view.api_key())
    };
    println!("API key: {key}");
    println!("Images:  {}", view.len());
    if let Some(main) = view.main_image() {
        println!("Main:    {}", short_id(&main.id));
    }
    print_notice(view);
}

fn payload_summary(payload: &ImagePayload) -> String {
    match payload.data_url_parts() {
        Some((mime, _)) => format!("embedded {mime} ({} bytes stored)", payload.stored_len()),
        None => clip(payload.locator(), 96),
    }
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((index, _)) => &id[..index],
        None => id,
    }
}

fn mask_key(key: &str) -> String {
    let chars = key.trim().chars().collect::<Vec<char>>();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head = chars[..3].iter().collect::<String>();
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("{head}...{tail}")
}

fn clip(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept = text
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use easel_engine::ResponseFormat;

    use super::{clip, mask_key, output_path, resolve_config, resolve_target, short_id, Cli};

    const IDS: [&str; 3] = [
        "3f2a9c10-0000-4000-8000-000000000001",
        "3f2b1111-0000-4000-8000-000000000002",
        "9a00aaaa-0000-4000-8000-000000000003",
    ];

    #[test]
    fn target_by_position() {
        assert_eq!(resolve_target(&IDS, "1"), Ok(IDS[0]));
        assert_eq!(resolve_target(&IDS, " 3 "), Ok(IDS[2]));
        assert!(resolve_target(&IDS, "0").is_err());
        let err = resolve_target(&IDS, "4").unwrap_err();
        assert!(err.contains("gallery has 3"));
    }

    #[test]
    fn target_by_id_prefix() {
        assert_eq!(resolve_target(&IDS, "9a"), Ok(IDS[2]));
        assert_eq!(resolve_target(&IDS, "3f2b"), Ok(IDS[1]));
        assert!(resolve_target(&IDS, "3f2").unwrap_err().contains("matches 2 images"));
        assert!(resolve_target(&IDS, "zz").unwrap_err().contains("no image matches"));
        assert!(resolve_target(&IDS, "").is_err());
    }

    #[test]
    fn numeric_prefix_beyond_gallery_falls_back_to_ids() {
        let ids = ["42aa", "bb"];
        assert_eq!(resolve_target(&ids, "42"), Ok("42aa"));
    }

    #[test]
    fn key_is_masked() {
        assert_eq!(mask_key("sk-abcdefghijklmnop"), "sk-...mnop");
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn text_helpers() {
        assert_eq!(clip("a lighthouse", 40), "a lighthouse");
        assert_eq!(clip("abcdefghij", 6), "abc...");
        assert_eq!(short_id(IDS[0]), "3f2a9c10");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn output_path_appends_file_name_for_directories() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        assert_eq!(
            output_path(temp.path(), "abc", "png"),
            temp.path().join("abc.png")
        );
        let file = temp.path().join("boat.png");
        assert_eq!(output_path(&file, "abc", "jpg"), file);
        Ok(())
    }

    #[test]
    fn global_flags_resolve_into_config() {
        let cli = Cli::parse_from([
            "easel",
            "--data-dir",
            "/tmp/easel-test",
            "--response-format",
            "url",
            "--provider",
            "DryRun",
            "list",
        ]);
        let config = resolve_config(&cli.global);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/easel-test")));
        assert_eq!(config.response_format, ResponseFormat::Url);
        assert_eq!(config.provider, "dryrun");
        assert_eq!(config.model, "dall-e-3");

        let ephemeral = Cli::parse_from(["easel", "list", "--ephemeral"]);
        assert_eq!(resolve_config(&ephemeral.global).data_dir, None);
    }
}
