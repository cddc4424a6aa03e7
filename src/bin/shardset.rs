use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use walkdir::WalkDir;

use shardset::logger::{log_error, set_log_file};
use shardset::{
    ChainOptions, Dataset, DsId, IterateOptions, JobId, SlicePick, Value, Workspace, iterate_list,
};

#[derive(Parser)]
#[command(name = "shardset", version, about = "Inspect and export columnar datasets")]
struct Cli {
    /// Workdir root containing the job directories.
    #[arg(long, env = "SHARDSET_WORKDIR")]
    workdir: PathBuf,

    /// Optional log file for warnings.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a dataset's metadata summary.
    Info(InfoArgs),
    /// List all datasets under the workdir (or one job).
    List(ListArgs),
    /// Export a dataset (or its whole chain) as CSV.
    Export(ExportArgs),
}

#[derive(Parser)]
struct InfoArgs {
    /// Dataset identity, `job` or `job/name`.
    dataset: String,
}

#[derive(Parser)]
struct ListArgs {
    /// Limit the listing to one job.
    job: Option<String>,
}

#[derive(Parser)]
struct ExportArgs {
    /// Dataset identity, `job` or `job/name`.
    dataset: String,

    /// Output file; stdout when omitted.
    #[arg(long, short)]
    out: Option<PathBuf>,

    /// Follow `previous` links and export the whole chain.
    #[arg(long)]
    chain: bool,

    /// Only these columns (default: all, in name order).
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    if let Some(path) = &cli.log_file
        && let Err(err) = set_log_file(path)
    {
        log_error(&format!("cannot open log file {}: {err}", path.display()));
        std::process::exit(1);
    }
    let result = match &cli.command {
        Command::Info(args) => info(&cli.workdir, args),
        Command::List(args) => list(&cli.workdir, args),
        Command::Export(args) => export(&cli.workdir, args),
    };
    if let Err(err) = result {
        log_error(&err.to_string());
        std::process::exit(1);
    }
}

fn open_dataset(workdir: &Path, identity: &str) -> shardset::Result<(Workspace, Dataset)> {
    let id: DsId = identity.parse()?;
    let ws = Workspace::detect(workdir, &id)?;
    let ds = ws.dataset(&id)?;
    Ok((ws, ds))
}

fn info(workdir: &Path, args: &InfoArgs) -> shardset::Result<()> {
    let (ws, ds) = open_dataset(workdir, &args.dataset)?;
    let (columns, rows) = ds.shape();
    println!("dataset   {ds}");
    println!("slices    {}", ws.slices());
    println!("columns   {columns}");
    println!("rows      {rows}  (per slice: {:?})", ds.lines());
    if let Some(hl) = ds.hashlabel() {
        println!("hashlabel {hl}");
    }
    if let Some(prev) = ds.previous() {
        println!("previous  {prev}");
    }
    if let Some(parent) = ds.parent() {
        match parent {
            shardset::Parent::Single(p) => println!("parent    {p}"),
            shardset::Parent::Pair(a, b) => println!("parent    {a} + {b}"),
        }
    }
    for (name, dc) in ds.columns() {
        let merged = if dc.offsets.is_some() { " (merged)" } else { "" };
        println!("  {name}: {}{merged}", dc.ty);
    }
    Ok(())
}

fn list(workdir: &Path, args: &ListArgs) -> shardset::Result<()> {
    let roots: Vec<PathBuf> = match &args.job {
        Some(job) => vec![workdir.join(job)],
        None => vec![workdir.to_path_buf()],
    };
    for root in roots {
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if entry.file_name() != "datasets.txt" {
                continue;
            }
            let Some(job_name) = entry.path().parent().and_then(|p| p.file_name()) else {
                continue;
            };
            let job = JobId::new(job_name.to_string_lossy())?;
            let ws_probe = std::fs::read_to_string(entry.path())?;
            for name in ws_probe.lines() {
                let id = DsId::new(job.clone(), name)?;
                match Workspace::detect(workdir, &id).and_then(|ws| ws.dataset(&id)) {
                    Ok(ds) => {
                        let (columns, rows) = ds.shape();
                        println!("{ds}  ({columns} columns, {rows} rows)");
                    }
                    Err(err) => log_error(&format!("{id}: {err}")),
                }
            }
        }
    }
    Ok(())
}

fn export(workdir: &Path, args: &ExportArgs) -> shardset::Result<()> {
    let (_ws, ds) = open_dataset(workdir, &args.dataset)?;
    let columns: Vec<String> = if args.columns.is_empty() {
        ds.columns().keys().cloned().collect()
    } else {
        let mut columns = args.columns.clone();
        columns.sort();
        columns
    };
    let datasets = if args.chain {
        ds.chain(&ChainOptions::new())?.datasets().to_vec()
    } else {
        vec![ds]
    };
    let opts = IterateOptions::new().with_columns(columns.clone());
    let rows = iterate_list(datasets, SlicePick::All, opts)?;

    let out: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut csv = csv::Writer::from_writer(out);
    csv.write_record(&columns).map_err(csv_error)?;
    let mut float_buf = ryu::Buffer::new();
    let mut int_buf = itoa::Buffer::new();
    for row in rows {
        let row = row?;
        csv.write_record(row.iter().map(|v| csv_field(v, &mut float_buf, &mut int_buf)))
            .map_err(csv_error)?;
    }
    csv.flush()?;
    Ok(())
}

fn csv_field(value: &Value, float_buf: &mut ryu::Buffer, int_buf: &mut itoa::Buffer) -> Vec<u8> {
    match value {
        Value::None => Vec::new(),
        Value::Int(v) => int_buf.format(*v).as_bytes().to_vec(),
        Value::Uint(v) => int_buf.format(*v).as_bytes().to_vec(),
        Value::Float(v) => float_buf.format(*v).as_bytes().to_vec(),
        Value::Bytes(v) => v.clone(),
        other => other.to_string().into_bytes(),
    }
}

fn csv_error(err: csv::Error) -> shardset::Error {
    shardset::Error::Io(io::Error::other(err))
}
