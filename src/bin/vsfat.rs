//! `vsfat <listen-addr> <folder-to-export> [--debug] [--sectors-per-cluster <N>] [--fat-size <sectors>]`
//!
//! Scans `folder-to-export` into a synthetic read-only FAT32 image and
//! serves it as a userspace NBD export bound to `listen-addr`.
//!
//! Mirrors `original_source/vsfat.c`'s `main` (build MBR, build boot
//! sector, build FATs, build root dir, scan folder, launch transport),
//! with the usage line adapted to this crate's actual transport: the
//! source hands its block device off to the kernel via
//! `ioctl(/dev/nbd0, ...)`, which is the explicitly out-of-scope
//! external collaborator (spec §1); this binary instead binds a real
//! NBD *network* server directly (`transport::nbd::serve`), so the
//! first positional argument names a listen address rather than a
//! `/dev/nbdN` node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use vsfat::backend::Backend;
use vsfat::geometry::Geometry;
use vsfat::image::ImageBuilder;
use vsfat::transport::nbd;

/// Export a local directory as a read-only FAT32 volume over the network block device protocol.
#[derive(Parser, Debug)]
#[command(name = "vsfat", version, about)]
struct Args {
    /// Address to bind the NBD server to, e.g. `127.0.0.1:10809`.
    listen_addr: SocketAddr,

    /// Host directory to export as the volume's contents.
    folder: PathBuf,

    /// Enable verbose (debug-level) logging.
    #[arg(long)]
    debug: bool,

    /// Sectors per cluster (defaults to the geometry's built-in value).
    #[arg(long)]
    sectors_per_cluster: Option<u32>,

    /// FAT size in sectors, per copy (defaults to the geometry's built-in value).
    #[arg(long = "fat-size")]
    fat_size_sectors: Option<u32>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    let level = if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).init();

    if !args.folder.is_dir() {
        log::error!("{}: not a directory", args.folder.display());
        return ExitCode::from(1);
    }

    let mut geometry = Geometry::default();
    if let Some(spc) = args.sectors_per_cluster {
        geometry.sectors_per_cluster = spc;
    }
    if let Some(fat_size) = args.fat_size_sectors {
        geometry.fat_size_sectors = fat_size;
    }

    let mut builder = ImageBuilder::new(geometry);
    if let Err(e) = builder.scan_folder(&args.folder) {
        log::error!("failed to scan {}: {e}", args.folder.display());
        return ExitCode::from(1);
    }

    let image = builder.freeze();
    log::info!("built {} byte image from {}", image.size_bytes(), args.folder.display());

    let device: Arc<dyn vsfat::BlockDevice> = Arc::new(Backend::new(image));
    if let Err(e) = nbd::serve(args.listen_addr, device) {
        log::error!("server error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}
