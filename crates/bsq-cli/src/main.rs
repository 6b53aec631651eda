#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use asupersync::Cx;
use bsq::{
    DataLength, FragmentRef, MountOptions, PageActor, RegularFileLayout, SquashFs,
    detect_image_at_path,
};
use serde::Serialize;
use std::env;
use std::io::Write;
use std::path::Path;
use tracing::debug;
use tracing_subscriber::EnvFilter;

// ── Production Cx acquisition ───────────────────────────────────────────────

/// Create a production `Cx` for CLI commands.
///
/// Uses ephemeral region/task IDs (not test IDs) and an infinite budget
/// for synchronous reads.
fn cli_cx() -> Cx {
    Cx::for_request()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Serialize)]
struct FragmentOutput {
    fragment: u32,
    start_block: u64,
    size: u32,
    compressed: bool,
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// Flags shared by every command.
struct Common {
    json: bool,
    options: MountOptions,
    fragment: Option<FragmentRef>,
}

fn split_flags(mut args: impl Iterator<Item = String>) -> Result<(Vec<String>, Common)> {
    let mut positional = Vec::new();
    let mut common = Common {
        json: false,
        options: MountOptions::default(),
        fragment: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => common.json = true,
            "--skip-validation" => common.options.skip_validation = true,
            "--devblksize" => {
                let Some(value) = args.next() else {
                    bail!("--devblksize requires a value");
                };
                common.options.device_block_size = parse_u32(&value)
                    .with_context(|| format!("invalid device block size: {value}"))?;
            }
            "--fragment" => {
                let Some(value) = args.next() else {
                    bail!("--fragment requires <index>:<offset>");
                };
                common.fragment = parse_fragment(&value)?;
            }
            _ => positional.push(arg),
        }
    }
    Ok((positional, common))
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let (positional, common) = split_flags(args)?;
    let arg = |n: usize, what: &str| positional_arg(&positional, n, &command, what);

    match command.as_str() {
        "inspect" => inspect(Path::new(arg(0, "an image path")?), &common),
        "meta" => {
            let index = parse_u64(arg(1, "<image> <index>")?)?;
            meta(Path::new(arg(0, "<image> <index>")?), index, &common)
        }
        "block" => {
            let usage = "<image> <index> <length-word>";
            let index = parse_u64(arg(1, usage)?)?;
            let word = parse_u32(arg(2, usage)?)?;
            block(Path::new(arg(0, usage)?), index, DataLength::new(word), &common)
        }
        "fragment" => {
            let n = parse_u32(arg(1, "<image> <fragment>")?)?;
            fragment(Path::new(arg(0, "<image> <fragment>")?), n, &common)
        }
        "cat" => {
            let usage = "<image> <start-block> <file-size> [length-word,...]";
            let start = parse_u64(arg(1, usage)?)?;
            let size = parse_u64(arg(2, usage)?)?;
            let lengths = positional
                .get(3)
                .map(|list| parse_lengths(list))
                .transpose()?
                .unwrap_or_default();
            cat(Path::new(arg(0, usage)?), start, size, lengths, &common)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn positional_arg<'a>(
    positional: &'a [String],
    n: usize,
    command: &str,
    what: &str,
) -> Result<&'a str> {
    positional
        .get(n)
        .map(String::as_str)
        .with_context(|| format!("{command} requires {what}"))
}

fn print_usage() {
    println!("bsq-cli\n");
    println!("USAGE:");
    println!("  bsq-cli inspect <image> [--json]");
    println!("  bsq-cli meta <image> <index>");
    println!("  bsq-cli block <image> <index> <length-word>");
    println!("  bsq-cli fragment <image> <fragment> [--json]");
    println!(
        "  bsq-cli cat <image> <start-block> <file-size> [length-word,...] [--fragment <n>:<offset>]"
    );
    println!();
    println!("OPTIONS:");
    println!("  --devblksize <n>     device block size (default 1024)");
    println!("  --skip-validation    skip image/device cross-checks at mount");
    println!();
    println!("Numbers accept a 0x prefix. Set RUST_LOG=debug for read tracing.");
}

fn parse_u64(text: &str) -> Result<u64> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid number: {text}"))
}

fn parse_u32(text: &str) -> Result<u32> {
    u32::try_from(parse_u64(text)?).with_context(|| format!("{text} does not fit in 32 bits"))
}

fn parse_fragment(text: &str) -> Result<Option<FragmentRef>> {
    let Some((index, offset)) = text.split_once(':') else {
        bail!("fragment must be <index>:<offset>, got {text}");
    };
    Ok(FragmentRef::from_inode(parse_u32(index)?, parse_u32(offset)?))
}

fn parse_lengths(list: &str) -> Result<Vec<DataLength>> {
    list.split(',')
        .filter(|word| !word.is_empty())
        .map(|word| parse_u32(word).map(DataLength::new))
        .collect()
}

fn mount(cx: &Cx, path: &Path, common: &Common) -> Result<SquashFs> {
    debug!(
        path = %path.display(),
        device_block_size = common.options.device_block_size,
        "mounting"
    );
    SquashFs::open_path(cx, path, &common.options)
        .with_context(|| format!("failed to mount image: {}", path.display()))
}

fn inspect(path: &Path, common: &Common) -> Result<()> {
    let cx = cli_cx();
    detect_image_at_path(&cx, path)
        .with_context(|| format!("failed to detect squashfs metadata in {}", path.display()))?;
    let info = mount(&cx, path, common)?.info();

    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info).context("serialize output")?
        );
        return Ok(());
    }

    let sb = &info.superblock;
    println!("BootSquash Inspector");
    println!("version: {}.{}", sb.version_major, sb.version_minor);
    println!("compression: {}", sb.compression);
    println!("block_size: {}", sb.block_size);
    println!("inodes: {}", sb.inodes);
    println!("fragments: {}", sb.fragments);
    println!("flags: {}", sb.flags);
    println!("bytes_used: {}", sb.bytes_used);
    println!("device_len: {}", info.device_len);
    println!("device_block_size: {}", info.device_block_size);
    println!("inode_table_start: {:#x}", sb.inode_table_start);
    println!("directory_table_start: {:#x}", sb.directory_table_start);
    println!("fragment_table_start: {:#x}", sb.fragment_table_start);
    println!("fragment_index: {:x?}", info.fragment_index);
    Ok(())
}

fn meta(path: &Path, index: u64, common: &Common) -> Result<()> {
    let cx = cli_cx();
    let fs = mount(&cx, path, common)?;
    let (bytes, next) = fs
        .read_metadata_block(&cx, index)
        .with_context(|| format!("failed to read metadata block at {index:#x}"))?;
    eprintln!("{} bytes, next block at {next:#x}", bytes.len());
    hexdump(&bytes)
}

fn block(path: &Path, index: u64, length: DataLength, common: &Common) -> Result<()> {
    let cx = cli_cx();
    let fs = mount(&cx, path, common)?;
    let mut output = PageActor::new(fs.params().block_size as usize);
    let len = fs
        .read_data(&cx, index, length, &mut output)
        .with_context(|| format!("failed to read data block at {index:#x}"))?;
    eprintln!("{len} bytes decoded");
    hexdump(&output.to_vec()?)
}

fn fragment(path: &Path, n: u32, common: &Common) -> Result<()> {
    let cx = cli_cx();
    let fs = mount(&cx, path, common)?;
    let entry = fs
        .fragment_entry(&cx, n)
        .with_context(|| format!("failed to look up fragment {n}"))?;
    let output = FragmentOutput {
        fragment: n,
        start_block: entry.start_block,
        size: entry.size.size(),
        compressed: entry.size.compressed(),
    };
    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("fragment: {}", output.fragment);
        println!("start_block: {:#x}", output.start_block);
        println!("size: {}", output.size);
        println!("compressed: {}", output.compressed);
    }
    Ok(())
}

fn cat(
    path: &Path,
    start: u64,
    size: u64,
    lengths: Vec<DataLength>,
    common: &Common,
) -> Result<()> {
    let cx = cli_cx();
    let fs = mount(&cx, path, common)?;
    let layout = RegularFileLayout::new(
        start,
        size,
        fs.params().block_size,
        lengths,
        common.fragment,
    )
    .context("invalid file layout")?;
    let mut file = fs.open(layout).context("failed to open file")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0_u8; 64 * 1024];
    loop {
        let n = file
            .read(&cx, &mut buf)
            .with_context(|| format!("read failed at offset {}", file.position()))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("write to stdout")?;
    }
    file.close();
    out.flush().context("flush stdout")
}

fn hexdump(bytes: &[u8]) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let text: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        writeln!(out, "{:08x}  {:<47}  {text}", row * 16, hex.join(" ")).context("write")?;
    }
    Ok(())
}
