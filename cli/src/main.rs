use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hlsdl_core::storage::SqliteStorage;
use hlsdl_core::{
    CoreError, DownloadEngine, EngineConfig, OutputFormat, PostProcess, TaskId, TaskOptions,
    TaskSnapshot, TaskStatus,
};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    init_logging();

    let engine = match build_engine() {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "add" => match parse_options(&args[2..]) {
            Some(options) => match engine.create(options) {
                Ok(id) => println!("added task: {}", id),
                Err(err) => eprintln!("error: {}", err),
            },
            None => print_usage(),
        },
        "download" => match parse_options(&args[2..]) {
            Some(options) => match engine.create(options) {
                Ok(id) => {
                    println!("added task: {}", id);
                    run_and_wait(&engine, &id, |engine, id| engine.start(id));
                }
                Err(err) => eprintln!("error: {}", err),
            },
            None => print_usage(),
        },
        "list" => match engine.list() {
            Ok(snapshots) => {
                for snapshot in snapshots {
                    println!("{}", describe(&snapshot));
                }
            }
            Err(err) => eprintln!("error: {}", err),
        },
        "start" => with_id(&args, 2, |id| {
            run_and_wait(&engine, id, |engine, id| engine.start(id));
            Ok(())
        }),
        "resume" => with_id(&args, 2, |id| {
            run_and_wait(&engine, id, |engine, id| engine.resume(id));
            Ok(())
        }),
        "retry" => with_id(&args, 2, |id| match args.get(3) {
            Some(index) => {
                let index = index.parse::<usize>().map_err(|_| {
                    CoreError::InvalidState(format!("invalid segment index {}", index))
                })?;
                engine.retry(id, index)?;
                println!("segment {} queued for retry", index);
                Ok(())
            }
            None => {
                let count = engine.retry_failed(id)?;
                println!("{} segment(s) queued for retry", count);
                Ok(())
            }
        }),
        "force-save" => with_id(&args, 2, |id| {
            let (path, bytes) = engine.force_save(id)?;
            println!("saved {} to {}", format_bytes(bytes), path.display());
            Ok(())
        }),
        "delete" => with_id(&args, 2, |id| {
            let remove_files = args.iter().skip(3).any(|arg| arg == "--files");
            engine.delete(id, remove_files)?;
            println!("deleted task: {}", id);
            Ok(())
        }),
        _ => print_usage(),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn build_engine() -> Result<DownloadEngine, CoreError> {
    let mut engine = DownloadEngine::new(EngineConfig::from_env())?;
    if let Ok(path) = env::var("HLSDL_DB") {
        let storage = SqliteStorage::new(path.clone())?;
        engine = engine.with_storage(Box::new(storage));
        let restored = engine.restore()?;
        debug!(db = %path, restored, "opened task database");
    }
    Ok(engine)
}

fn parse_options(args: &[String]) -> Option<TaskOptions> {
    let mut iter = args.iter();
    let mut options = TaskOptions::new(iter.next()?.clone());
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--no-decrypt" => options = options.decrypt(false),
            "--title" => options = options.title(iter.next()?.clone()),
            "--out" => options = options.output_dir(PathBuf::from(iter.next()?)),
            "--format" => options = options.format(OutputFormat::from_str(iter.next()?)?),
            "--start" => options.start_segment = Some(iter.next()?.parse().ok()?),
            "--end" => options.end_segment = Some(iter.next()?.parse().ok()?),
            "--concurrency" => options = options.concurrency(iter.next()?.parse().ok()?),
            "--header" => {
                let (name, value) = iter.next()?.split_once(':')?;
                options = options.header(name.trim(), value.trim());
            }
            other => {
                eprintln!("unknown option {}", other);
                return None;
            }
        }
    }
    Some(options)
}

fn with_id<F>(args: &[String], idx: usize, f: F)
where
    F: FnOnce(&TaskId) -> Result<(), CoreError>,
{
    let id = match args.get(idx) {
        Some(value) => value,
        None => {
            print_usage();
            return;
        }
    };

    let task_id = match TaskId::parse_str(id) {
        Ok(value) => value,
        Err(_) => {
            eprintln!("invalid task id");
            return;
        }
    };

    if let Err(err) = f(&task_id) {
        eprintln!("error: {}", err);
    }
}

fn run_and_wait<F>(engine: &Arc<DownloadEngine>, id: &TaskId, launch: F)
where
    F: FnOnce(&DownloadEngine, &TaskId) -> Result<(), CoreError>,
{
    if let Err(err) = launch(engine, id) {
        eprintln!("error: {}", err);
        return;
    }
    let (handle, stop) = spawn_progress(Arc::clone(engine), *id);
    let result = engine.wait(id);
    stop.store(true, Ordering::SeqCst);
    let _ = handle.join();

    match result {
        Ok(snapshot) => {
            println!("{}", describe(&snapshot));
            if let Some(path) = &snapshot.task.output_path {
                println!("output: {}", path.display());
            }
            if let Some(PostProcess::Failed { reason }) = &snapshot.task.post_process {
                println!("muxing skipped: {}", reason);
            }
        }
        Err(err) => eprintln!("error: {}", err),
    }
}

fn spawn_progress(
    engine: Arc<DownloadEngine>,
    id: TaskId,
) -> (thread::JoinHandle<()>, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = Arc::clone(&stop);
    let handle = thread::spawn(move || loop {
        if stop_clone.load(Ordering::SeqCst) {
            break;
        }
        if let Ok(snapshot) = engine.get(&id) {
            if snapshot.status() == TaskStatus::Running {
                println!("{}", describe(&snapshot));
            }
        }
        thread::sleep(Duration::from_secs(1));
    });
    (handle, stop)
}

fn describe(snapshot: &TaskSnapshot) -> String {
    let task = &snapshot.task;
    let eta = snapshot
        .eta
        .map(|eta| format_duration(eta.as_secs()))
        .unwrap_or_else(|| "--:--".to_string());
    let total = snapshot
        .expected_bytes
        .map(format_bytes)
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{}\t[{}] {} {:.1}% {}/{} ({}/s) eta {} segments {}..={} {}",
        task.id,
        task.status,
        task.title,
        snapshot.progress * 100.0,
        format_bytes(task.bytes_completed),
        total,
        format_bytes(snapshot.speed_bps as u64),
        eta,
        task.range.start,
        task.range.end,
        task.message.as_deref().unwrap_or(""),
    )
}

fn print_usage() {
    eprintln!(
        "Usage: hlsdl-cli <command> [args]\n\
Commands:\n\
  add <url> [options]       Create a task from a media playlist\n\
  download <url> [options]  Create a task and download it\n\
  list                      List tasks\n\
  start <id>                Start a task and wait\n\
  resume <id>               Resume a paused task and wait\n\
  retry <id> [index]        Retry one failed segment, or all of them\n\
  force-save <id>           Write the finished prefix to <title>.partial.ts\n\
  delete <id> [--files]     Delete a task, optionally with its output\n\
Options:\n\
  --title <name>  --format ts|mp4  --start <index>  --end <index>\n\
  --concurrency <n>  --header 'Name: value'  --out <dir>  --no-decrypt\n\
Environment:\n\
  HLSDL_DB=/path/to/db      Persist tasks in SQLite\n\
  HLSDL_OUTPUT_DIR          Default output dir (files)\n\
  RUST_LOG                  Log filter (info)"
    );
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
