use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use entangled_config::Config;
use entangled_engine::{Context, FileStatus};
use relative_path::RelativePathBuf;

#[derive(Parser)]
#[command(name = "entangled", version, about = "Tangle code out of Markdown, stitch edits back in")]
struct Cli {
    /// Path to entangled.toml. Defaults to <directory>/entangled.toml.
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Base directory to operate in. Defaults to the current directory.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    directory: PathBuf,

    /// Raise log verbosity to debug.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default entangled.toml and create .entangled/.
    Init {
        /// Overwrite an existing entangled.toml.
        #[arg(short, long)]
        force: bool,
    },
    /// Extract target files from Markdown sources.
    Tangle {
        #[arg(short, long)]
        force: bool,
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// Dry-run and print a diff against what's currently on disk.
        #[arg(short = 'd', long)]
        diff: bool,
    },
    /// Propagate edits in tangled targets back into their Markdown.
    Stitch {
        /// Target file to stitch. Defaults to every tracked target.
        files: Vec<PathBuf>,
        #[arg(short, long)]
        force: bool,
        #[arg(short = 'n', long)]
        dry_run: bool,
        #[arg(short = 'd', long)]
        diff: bool,
    },
    /// Stitch externally-modified targets, then tangle.
    Sync {
        #[arg(short, long)]
        force: bool,
        #[arg(short = 'n', long)]
        dry_run: bool,
        #[arg(short = 'd', long)]
        diff: bool,
    },
    /// Poll for changes and sync automatically.
    Watch {
        #[arg(long)]
        debounce: Option<u64>,
    },
    /// Report the status of every tracked file.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Resolve TARGET:LINE back to its Markdown origin.
    Locate { target: String },
    /// Print the effective, fully-resolved configuration.
    Config,
    /// Clear the file database.
    Reset {
        #[arg(long)]
        delete_files: bool,
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if let Command::Init { force } = &cli.command {
        return cmd_init(&cli.directory, cli.config.as_deref(), *force);
    }

    let mut ctx = match &cli.config {
        Some(config_path) => Context::with_config_path(&cli.directory, config_path)?,
        None => Context::new(&cli.directory)?,
    };

    match cli.command {
        Command::Init { .. } => unreachable!("handled above"),
        Command::Tangle { force, dry_run, diff } => cmd_tangle(&mut ctx, force, dry_run || diff, diff),
        Command::Stitch { files, force, dry_run, diff } => {
            cmd_stitch(&mut ctx, &files, force, dry_run || diff, diff)
        }
        Command::Sync { force, dry_run, diff } => cmd_sync(&mut ctx, force, dry_run || diff, diff),
        Command::Watch { debounce } => cmd_watch(&mut ctx, debounce),
        Command::Status { json } => cmd_status(&ctx, json),
        Command::Locate { target } => cmd_locate(&ctx, &target),
        Command::Config => cmd_config(&ctx),
        Command::Reset { delete_files, force } => cmd_reset(&mut ctx, delete_files, force),
    }
}

fn cmd_init(base_dir: &std::path::Path, config_path: Option<&std::path::Path>, force: bool) -> anyhow::Result<()> {
    let default_path = base_dir.join("entangled.toml");
    let path = config_path.unwrap_or(&default_path);
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    Config::default().save_to_path(path)?;
    std::fs::create_dir_all(base_dir.join(".entangled"))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn cmd_tangle(ctx: &mut Context, force: bool, dry_run: bool, diff: bool) -> anyhow::Result<()> {
    let documents = ctx.load_documents()?;
    if dry_run {
        let outputs = ctx.tangle_documents(&documents)?;
        let txn = entangled_engine::plan_tangle(&outputs, &ctx.db, &ctx.base_dir, force)?;
        print_preview(&txn, &ctx.base_dir, diff)?;
        return Ok(());
    }
    let report = ctx.execute_tangle(&documents, force)?;
    print_report("tangle", &report);
    if report.is_success() {
        ctx.save_filedb()?;
    } else if let Some(err) = report.error {
        anyhow::bail!(err);
    }
    Ok(())
}

fn cmd_stitch(
    ctx: &mut Context,
    files: &[PathBuf],
    force: bool,
    dry_run: bool,
    diff: bool,
) -> anyhow::Result<()> {
    let documents = ctx.load_documents()?;
    let targets: Vec<RelativePathBuf> = if files.is_empty() {
        ctx.tracked_files().cloned().collect()
    } else {
        files
            .iter()
            .map(|p| RelativePathBuf::from(p.to_string_lossy().replace('\\', "/")))
            .collect()
    };

    let mut diffs = Vec::new();
    for target in &targets {
        if entangled_engine::resolve::root_name_for_target(&documents, target).is_none() {
            continue;
        }
        diffs.extend(ctx.stitch_target(target, &documents)?);
    }

    if dry_run {
        let txn = entangled_engine::plan_stitch(&diffs);
        print_preview(&txn, &ctx.base_dir, diff)?;
        return Ok(());
    }

    let txn = entangled_engine::plan_stitch(&diffs);
    let report = entangled_engine::apply(&txn, &ctx.base_dir, force)?;
    print_report("stitch", &report);
    if report.is_success() {
        ctx.save_filedb()?;
    } else if let Some(err) = report.error {
        anyhow::bail!(err);
    }
    Ok(())
}

fn cmd_sync(ctx: &mut Context, force: bool, dry_run: bool, _diff: bool) -> anyhow::Result<()> {
    if dry_run {
        println!("sync --dry-run is not supported; run `tangle -n` or `stitch -n` instead");
        return Ok(());
    }
    let (stitch_report, tangle_report) = ctx.sync(force)?;
    print_report("stitch", &stitch_report);
    print_report("tangle", &tangle_report);
    if stitch_report.is_success() && tangle_report.is_success() {
        ctx.save_filedb()?;
    }
    Ok(())
}

fn cmd_watch(ctx: &mut Context, debounce: Option<u64>) -> anyhow::Result<()> {
    let debounce_ms = debounce.unwrap_or(ctx.config.watch.debounce_ms);
    log::info!("watching {} (debounce {debounce_ms}ms, Ctrl-C to stop)", ctx.base_dir.display());
    loop {
        let (stitch_report, tangle_report) = ctx.sync(false)?;
        if !stitch_report.completed.is_empty() || !tangle_report.completed.is_empty() {
            ctx.save_filedb()?;
            print_report("stitch", &stitch_report);
            print_report("tangle", &tangle_report);
        }
        std::thread::sleep(std::time::Duration::from_millis(debounce_ms));
    }
}

fn cmd_status(ctx: &Context, json: bool) -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct Row {
        path: String,
        status: &'static str,
    }

    let mut rows = Vec::new();
    for path in ctx.tracked_files() {
        let status = ctx.db.classify(&ctx.base_dir, path)?;
        rows.push(Row {
            path: path.as_str().to_string(),
            status: status_label(status),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            println!("{:12} {}", row.status, row.path);
        }
    }
    Ok(())
}

fn status_label(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Unchanged => "unchanged",
        FileStatus::ModifiedExternally => "modified",
        FileStatus::Missing => "missing",
        FileStatus::Untracked => "untracked",
    }
}

fn cmd_locate(ctx: &Context, target: &str) -> anyhow::Result<()> {
    let (path, line) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected FILE:LINE, got `{target}`"))?;
    let line: usize = line.parse()?;
    let target_path = RelativePathBuf::from(path.replace('\\', "/"));
    match entangled_engine::locate(&ctx.db, &target_path, line) {
        Some(loc) => println!("{}:{} ({})", loc.source_file, loc.source_line, loc.block_id),
        None => println!("none"),
    }
    Ok(())
}

fn cmd_config(ctx: &Context) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(&ctx.config)?);
    Ok(())
}

fn cmd_reset(ctx: &mut Context, delete_files: bool, force: bool) -> anyhow::Result<()> {
    if delete_files {
        if !force {
            anyhow::bail!("--delete-files requires --force");
        }
        for path in ctx.tracked_files().cloned().collect::<Vec<_>>() {
            let abs = ctx.resolve_path(&path);
            if abs.exists() {
                std::fs::remove_file(abs)?;
            }
        }
    }
    ctx.clear_filedb();
    ctx.save_filedb()?;
    println!("file database cleared");
    Ok(())
}

fn print_report(label: &str, report: &entangled_engine::ApplyReport) {
    for action in &report.completed {
        log::info!("{label}: {}", describe(action));
    }
}

fn describe(action: &entangled_engine::Action) -> String {
    match action {
        entangled_engine::Action::CreateFile { path, .. } => format!("create {path}"),
        entangled_engine::Action::WriteFile { path, .. } => format!("write {path}"),
        entangled_engine::Action::DeleteFile { path, .. } => format!("delete {path}"),
        entangled_engine::Action::PatchDocument { source_path, .. } => format!("patch {source_path}"),
    }
}

fn print_preview(txn: &entangled_engine::Transaction, base_dir: &std::path::Path, show_diff: bool) -> anyhow::Result<()> {
    if txn.is_empty() {
        println!("nothing to do");
        return Ok(());
    }
    for line in txn.describe() {
        println!("{line}");
    }
    if show_diff {
        for diff in txn.diffs(base_dir)? {
            println!("{diff}");
        }
    }
    Ok(())
}
