use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use zdx::spacemap::{OpFilter, RangeFilter};
use zdx::view::{dsl, object, pool, spacemap, tree, zap, zpl};
use zdx::{PoolSession, Scope, ZfsError};

#[derive(Parser)]
#[command(name = "zdx", version, about = "Read-only ZFS pool metadata inspector")]
struct Cli {
    /// Expected pool name; the devices must belong to it
    #[arg(long, env = "ZDX_POOL", global = true)]
    pool: Option<String>,
    /// Device of one top-level vdev, in vdev id order. Join mirror children with `+`.
    #[arg(long = "device", env = "ZDX_DEVICES", value_delimiter = ',', global = true)]
    devices: Vec<String>,
    /// Indent the JSON output
    #[arg(long, global = true)]
    pretty: bool,
    /// Log filter, overriding RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

/// Selects the objset an object id is resolved in
#[derive(Args, Clone, Copy)]
struct ScopeArg {
    /// Dataset object id of the objset; the MOS when absent
    #[arg(long)]
    objset: Option<u64>,
}

impl ScopeArg {
    fn scope(self) -> Scope {
        self.objset.map_or(Scope::Mos, Scope::Dataset)
    }
}

#[derive(Args)]
struct FilterArgs {
    /// `all`, `alloc` or `free`
    #[arg(long, default_value = "all")]
    op: String,
    #[arg(long, default_value_t = 0)]
    min_length: u64,
    #[arg(long, default_value_t = 0)]
    txg_min: u64,
    #[arg(long, default_value_t = 0)]
    txg_max: u64,
}

impl FilterArgs {
    fn filter(&self) -> Result<RangeFilter, ZfsError> {
        RangeFilter::new(
            OpFilter::parse(&self.op)?,
            self.min_length,
            self.txg_min,
            self.txg_max,
        )
    }
}

#[derive(Subcommand)]
enum Command {
    /// The DMU object type catalog
    Types,
    /// Pool config and the active uberblock
    Pool,
    /// The vdev tree from the label
    Vdevs,
    /// Persistent error log records, paginated by cursor
    Errors {
        #[arg(long, default_value_t = 0)]
        cursor: u64,
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
    /// Raw bytes from a top-level vdev
    Block { vdev: u64, offset: u64, size: u64 },
    /// Allocated objects, paginated by id
    Objects {
        #[command(flatten)]
        scope: ScopeArg,
        #[arg(long = "type")]
        kind: Option<u8>,
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
    /// One object with its decoded bonus and typed edges
    Object {
        id: u64,
        #[command(flatten)]
        scope: ScopeArg,
    },
    /// Block pointers of one object
    Blkptrs {
        id: u64,
        #[command(flatten)]
        scope: ScopeArg,
    },
    /// Object, block pointers and, for ZAPs, the header and first entry page
    Get {
        id: u64,
        #[command(flatten)]
        scope: ScopeArg,
    },
    /// ZAP header summary
    ZapInfo {
        id: u64,
        #[command(flatten)]
        scope: ScopeArg,
    },
    /// Decoded ZAP entries, paginated by cursor
    Zap {
        id: u64,
        #[command(flatten)]
        scope: ScopeArg,
        #[arg(long, default_value_t = 0)]
        cursor: u64,
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
    /// Indirect block tree of one object
    Tree {
        id: u64,
        #[command(flatten)]
        scope: ScopeArg,
        #[arg(long, default_value_t = 0)]
        max_depth: u64,
        #[arg(long, default_value_t = 0)]
        max_nodes: u64,
    },
    /// The pool's root DSL directory and head dataset
    DslRoot,
    /// Child directories of a DSL directory
    DslChildren { dir: u64 },
    /// Head dataset of a DSL directory
    DslHead { dir: u64 },
    /// DSL directories below the pool's root directory
    DatasetTree {
        #[arg(long, default_value_t = 0)]
        depth: u64,
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
    /// Number of snapshots of a DSL directory's head dataset
    SnapshotCount { dir: u64 },
    /// Root block pointer of a dataset's objset
    DatasetObjset { dataset: u64 },
    /// Snapshots of a head dataset
    Snapshots { dataset: u64 },
    /// The prev/next snapshot chain around a dataset
    Lineage {
        dataset: u64,
        #[arg(long, default_value_t = 0)]
        max_prev: u64,
        #[arg(long, default_value_t = 0)]
        max_next: u64,
    },
    /// Root directory object of a filesystem
    Root { dataset: u64 },
    /// Entries of a filesystem directory, paginated by cursor
    Ls {
        dataset: u64,
        dir: u64,
        #[arg(long, default_value_t = 0)]
        cursor: u64,
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
    /// Resolve a path from the filesystem root
    Walk {
        dataset: u64,
        #[arg(default_value = "/")]
        path: String,
    },
    /// POSIX attributes of a znode
    Stat { dataset: u64, id: u64 },
    /// Logical bytes of an object
    Read {
        dataset: u64,
        id: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 0)]
        len: u64,
    },
    /// Space map totals and length histogram
    Spacemap { id: u64 },
    /// Space map entries matching the filters
    Ranges {
        id: u64,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 0)]
        cursor: u64,
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
    /// Space map entries totalled into offset bins
    Bins {
        id: u64,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 0)]
        bin_size: u64,
        #[arg(long, default_value_t = 0)]
        cursor: u64,
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(l) => EnvFilter::try_new(l).with_context(|| format!("invalid log filter {:?}", l))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logger: {}", err))
}

/// `--device` values as top-level vdevs, each a list of mirror children
fn vdev_paths(devices: &[String]) -> Vec<Vec<PathBuf>> {
    devices
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .map(|d| d.split('+').map(PathBuf::from).collect())
        .collect()
}

fn to_json<T: Serialize>(view: Result<T, ZfsError>) -> Result<Value> {
    Ok(serde_json::to_value(view?)?)
}

fn dispatch(session: &PoolSession, command: &Command) -> Result<Value> {
    use Command::*;
    match command {
        Types => to_json(Ok(pool::dmu_types())),
        Pool => to_json(Ok(pool::pool_summary(session))),
        Vdevs => to_json(Ok(pool::pool_vdevs(session))),
        Errors { cursor, limit } => to_json(pool::pool_errors(session, *cursor, *limit)),
        Block { vdev, offset, size } => to_json(pool::read_block(session, *vdev, *offset, *size)),
        Objects {
            scope,
            kind,
            start,
            limit,
        } => to_json(object::list_objects(
            session,
            scope.scope(),
            *kind,
            *start,
            *limit,
        )),
        Object { id, scope } => to_json(object::get_object(session, scope.scope(), *id)),
        Blkptrs { id, scope } => to_json(object::get_blkptrs(session, scope.scope(), *id)),
        Get { id, scope } => to_json(object::obj_get(session, scope.scope(), *id)),
        ZapInfo { id, scope } => to_json(zap::zap_info(session, scope.scope(), *id)),
        Zap {
            id,
            scope,
            cursor,
            limit,
        } => to_json(zap::zap_entries(session, scope.scope(), *id, *cursor, *limit)),
        Tree {
            id,
            scope,
            max_depth,
            max_nodes,
        } => to_json(tree::object_block_tree(
            session,
            scope.scope(),
            *id,
            *max_depth,
            *max_nodes,
        )),
        DslRoot => to_json(dsl::dsl_root_dir(session)),
        DslChildren { dir } => to_json(dsl::dsl_dir_children(session, *dir)),
        DslHead { dir } => to_json(dsl::dsl_dir_head(session, *dir)),
        DatasetTree { depth, limit } => to_json(dsl::dataset_tree(session, *depth, *limit)),
        SnapshotCount { dir } => to_json(dsl::dataset_snapshot_count(session, *dir)),
        DatasetObjset { dataset } => to_json(dsl::dataset_objset(session, *dataset)),
        Snapshots { dataset } => to_json(dsl::dataset_snapshots(session, *dataset)),
        Lineage {
            dataset,
            max_prev,
            max_next,
        } => to_json(dsl::snapshot_lineage(session, *dataset, *max_prev, *max_next)),
        Root { dataset } => to_json(zpl::objset_root(session, *dataset)),
        Ls {
            dataset,
            dir,
            cursor,
            limit,
        } => to_json(zpl::objset_dir_entries(
            session, *dataset, *dir, *cursor, *limit,
        )),
        Walk { dataset, path } => to_json(zpl::objset_walk(session, *dataset, path)),
        Stat { dataset, id } => to_json(zpl::objset_stat(session, *dataset, *id)),
        Read {
            dataset,
            id,
            offset,
            len,
        } => to_json(zpl::objset_read_data(session, *dataset, *id, *offset, *len)),
        Spacemap { id } => to_json(spacemap::spacemap_summary(session, *id)),
        Ranges {
            id,
            filters,
            cursor,
            limit,
        } => to_json(
            filters
                .filter()
                .and_then(|f| spacemap::spacemap_ranges(session, *id, &f, *cursor, *limit)),
        ),
        Bins {
            id,
            filters,
            bin_size,
            cursor,
            limit,
        } => to_json(filters.filter().and_then(|f| {
            spacemap::spacemap_bins(session, *id, &f, *bin_size, *cursor, *limit)
        })),
    }
}

fn print(value: &Value, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

fn run(cli: &Cli) -> Result<Value> {
    if let Command::Types = cli.command {
        return to_json(Ok(pool::dmu_types()));
    }
    let vdevs = vdev_paths(&cli.devices);
    debug!(vdevs = vdevs.len(), "opening pool");
    let session = PoolSession::open(cli.pool.as_deref(), &vdevs)?;
    let value = dispatch(&session, &cli.command);
    session.close();
    value
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.log_level.as_deref()) {
        eprintln!("error: {:#}", err);
        std::process::exit(2);
    }
    let code = match run(&cli) {
        Ok(value) => match print(&value, cli.pretty) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {:#}", err);
                2
            }
        },
        Err(err) => match err.downcast_ref::<ZfsError>() {
            Some(zfs) => {
                let body = json!({
                    "error": { "kind": zfs.class().as_str(), "message": zfs.to_string() }
                });
                match print(&body, cli.pretty) {
                    Ok(()) => 1,
                    Err(_) => 2,
                }
            }
            None => {
                eprintln!("error: {:#}", err);
                2
            }
        },
    };
    std::process::exit(code);
}
