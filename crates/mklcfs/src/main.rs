//! mklcfs - Create composefs (lcfs) metadata images from directories.

use std::{
    fs::File,
    io::{self, BufWriter, IsTerminal, Write},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rustix::fs::CWD;

use lcfs::{
    fs::{build_from_filesystem, BuildFlags},
    fsverity::FsVerityHashValue,
    tree::Node,
    writer::write_to,
};

/// Create a composefs metadata image from a source directory.
///
/// The image records the directory structure, attributes, xattrs, and
/// per-file content digests; regular file content itself stays outside
/// the image.
#[derive(Parser, Debug)]
#[command(name = "mklcfs", version, about)]
struct Args {
    /// Print the fs-verity digest of the image after writing.
    #[arg(long)]
    print_digest: bool,

    /// Print the fs-verity digest without writing the image.
    ///
    /// When set, IMAGE must be omitted.
    #[arg(long)]
    print_digest_only: bool,

    /// Set all timestamps to zero (Unix epoch).
    #[arg(long)]
    use_epoch: bool,

    /// Exclude device nodes from the image.
    #[arg(long)]
    skip_devices: bool,

    /// Exclude all extended attributes.
    #[arg(long)]
    skip_xattrs: bool,

    /// Record the fs-verity digest of each regular file.
    #[arg(long)]
    compute_digest: bool,

    /// The source directory.
    source: PathBuf,

    /// The output image path (use `-` for stdout).
    ///
    /// Must be omitted when using --print-digest-only.
    image: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    if args.print_digest_only && args.image.is_some() {
        bail!("IMAGE must be omitted when using --print-digest-only");
    }
    if !args.print_digest_only && args.image.is_none() {
        bail!("IMAGE is required (or use --print-digest-only)");
    }

    let mut flags = BuildFlags::empty();
    flags.set(BuildFlags::USE_EPOCH, args.use_epoch);
    flags.set(BuildFlags::SKIP_DEVICES, args.skip_devices);
    flags.set(BuildFlags::SKIP_XATTRS, args.skip_xattrs);
    flags.set(BuildFlags::COMPUTE_DIGEST, args.compute_digest);

    let root = build_from_filesystem(CWD, &args.source, flags)
        .with_context(|| format!("Failed to read source directory: {:?}", args.source))?;

    if !root.is_dir() {
        bail!("Source path is not a directory: {:?}", args.source);
    }

    if args.print_digest_only {
        let digest = write_to(&root, io::sink(), true)?.unwrap();
        println!("{}", digest.to_hex());
        return Ok(());
    }

    let image_path = args.image.as_ref().unwrap();
    let digest = write_image(&root, image_path, args.print_digest)?;

    if let Some(digest) = digest {
        println!("{}", digest.to_hex());
    }

    Ok(())
}

/// Streams the image to the given path (or stdout if `-`), returning the
/// fs-verity digest when requested.
fn write_image(
    root: &Node,
    path: &PathBuf,
    with_digest: bool,
) -> Result<Option<lcfs::fsverity::Sha256HashValue>> {
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        if stdout.is_terminal() {
            bail!(
                "Refusing to write binary image to terminal. Redirect stdout or use a file path."
            );
        }
        let mut sink = BufWriter::new(stdout.lock());
        let digest = write_to(root, &mut sink, with_digest)?;
        sink.flush()?;
        Ok(digest)
    } else {
        let file =
            File::create(path).with_context(|| format!("Failed to create image file: {path:?}"))?;
        let mut sink = BufWriter::new(file);
        let digest = write_to(root, &mut sink, with_digest)?;
        sink.into_inner()?.sync_data()?;
        Ok(digest)
    }
}
