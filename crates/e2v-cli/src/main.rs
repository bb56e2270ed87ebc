#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use e2v_core::Ext2Fs;
use e2v_ondisk::{Ext2DirEntry, Ext2Inode};
use e2v_types::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};
use serde::Serialize;
use std::env;
use std::io::Write;
use std::path::Path;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "ls" => {
            let Some(image) = args.next() else {
                bail!("ls requires <image-path> <path>");
            };
            let Some(path) = args.next() else {
                bail!("ls requires <image-path> <path>");
            };
            let json = args.any(|arg| arg == "--json");
            ls(Path::new(&image), &path, json)
        }
        "cat" => {
            let Some(image) = args.next() else {
                bail!("cat requires <image-path> <path>");
            };
            let Some(path) = args.next() else {
                bail!("cat requires <image-path> <path>");
            };
            cat(Path::new(&image), &path)
        }
        "info" => {
            let Some(image) = args.next() else {
                bail!("info requires <image-path>");
            };
            let json = args.any(|arg| arg == "--json");
            info(Path::new(&image), json)
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

fn print_usage() {
    println!("e2v\n");
    println!("USAGE:");
    println!("  e2v ls <image-path> <path> [--json]");
    println!("  e2v cat <image-path> <path>");
    println!("  e2v info <image-path> [--json]");
}

fn open_image(image: &Path) -> Result<Ext2Fs> {
    Ext2Fs::open(image)
        .with_context(|| format!("failed to open ext2 image: {}", image.display()))
}

#[derive(Debug, Serialize)]
struct LsEntry {
    inode: u32,
    mode: String,
    links: u16,
    uid: u16,
    gid: u16,
    size: u32,
    mtime: u32,
    name: String,
}

fn ls(image: &Path, path: &str, json: bool) -> Result<()> {
    let fs = open_image(image)?;
    let (ino, inode) = fs
        .resolve_path(path)
        .with_context(|| format!("failed to resolve {path}"))?;

    // `ls` of a file lists just that file, like the shell version.
    let listed: Vec<(u32, String, Ext2Inode)> = if inode.is_dir() {
        let entries = fs.read_dir(&inode)?;
        entries
            .iter()
            .map(|entry: &Ext2DirEntry| {
                let child = fs.read_inode(e2v_types::InodeNumber(entry.inode))?;
                Ok((entry.inode, entry.name_str(), child))
            })
            .collect::<Result<_>>()?
    } else {
        let name = path.rsplit('/').find(|c| !c.is_empty()).unwrap_or("/");
        vec![(ino.0, name.to_owned(), inode)]
    };

    let rows: Vec<LsEntry> = listed
        .iter()
        .map(|(child_ino, name, child)| LsEntry {
            inode: *child_ino,
            mode: mode_string(child.mode),
            links: child.links_count,
            uid: child.uid,
            gid: child.gid,
            size: child.size,
            mtime: child.mtime,
            name: name.clone(),
        })
        .collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("serialize output")?
        );
        return Ok(());
    }

    for row in &rows {
        println!(
            "{:>6} {} {:>3} {:>5} {:>5} {:>9} {} {}",
            row.inode,
            row.mode,
            row.links,
            row.uid,
            row.gid,
            row.size,
            format_timestamp(row.mtime),
            row.name
        );
    }
    Ok(())
}

fn cat(image: &Path, path: &str) -> Result<()> {
    let fs = open_image(image)?;
    let (ino, inode) = fs
        .resolve_path(path)
        .with_context(|| format!("failed to resolve {path}"))?;
    let data = fs
        .read_file(ino)
        .with_context(|| format!("failed to read {path}"))?;

    // Metadata header first, then the raw bytes.
    println!("inode: {ino}");
    println!("mode: {}", mode_string(inode.mode));
    println!("uid: {}  gid: {}", inode.uid, inode.gid);
    println!("size: {}", inode.size);
    println!("links: {}", inode.links_count);
    println!("blocks (512B sectors): {}", inode.blocks);
    println!("atime: {}", format_timestamp(inode.atime));
    println!("ctime: {}", format_timestamp(inode.ctime));
    println!("mtime: {}", format_timestamp(inode.mtime));
    if inode.dtime != 0 {
        println!("dtime: {}", format_timestamp(inode.dtime));
    }
    if inode.sparse_hint() {
        println!("sparse: likely (size exceeds allocated sectors)");
    }
    println!();

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&data)?;
    stdout.flush()?;
    Ok(())
}

fn info(image: &Path, json: bool) -> Result<()> {
    let fs = open_image(image)?;
    let summary = fs.summary();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize output")?
        );
        return Ok(());
    }

    println!("volume_name: {}", summary.volume_name);
    println!("uuid: {}", summary.uuid);
    println!("block_size: {}", summary.block_size);
    println!("blocks_count: {}", summary.blocks_count);
    println!("inodes_count: {}", summary.inodes_count);
    println!("free_blocks_count: {}", summary.free_blocks_count);
    println!("free_inodes_count: {}", summary.free_inodes_count);
    println!("first_data_block: {}", summary.first_data_block);
    println!("blocks_per_group: {}", summary.blocks_per_group);
    println!("inodes_per_group: {}", summary.inodes_per_group);
    println!("inode_size: {}", summary.inode_size);
    println!("inodes_per_block: {}", summary.inodes_per_block);
    println!("fs_bytes: {}", summary.fs_bytes);
    println!("groups_count: {}", summary.groups_count);
    println!("rev_level: {}", summary.rev_level);
    println!("state: {}", summary.state);
    println!("mtime: {}", format_timestamp(summary.mtime));
    println!("wtime: {}", format_timestamp(summary.wtime));
    if !summary.last_mounted.is_empty() {
        println!("last_mounted: {}", summary.last_mounted);
    }
    for group in &summary.groups {
        println!(
            "group {}: block_bitmap={} inode_bitmap={} inode_table={} free_blocks={} free_inodes={} used_dirs={}",
            group.group,
            group.block_bitmap,
            group.inode_bitmap,
            group.inode_table,
            group.free_blocks_count,
            group.free_inodes_count,
            group.used_dirs_count
        );
    }
    Ok(())
}

/// Render a mode as the ten-character `ls -l` style string.
fn mode_string(mode: u16) -> String {
    let type_char = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFCHR => 'c',
        S_IFBLK => 'b',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        S_IFREG => '-',
        _ => '?',
    };

    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6_u16, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Format a Unix timestamp as `MMM DD YYYY HH:MM` in UTC.
///
/// Uses the days-to-civil conversion so no date crate is needed for a single
/// fixed format.
fn format_timestamp(secs: u32) -> String {
    let days = i64::from(secs) / 86_400;
    let rem = i64::from(secs) % 86_400;
    let (year, month, day) = civil_from_days(days);
    let hour = rem / 3600;
    let minute = (rem % 3600) / 60;
    format!(
        "{} {:02} {:4} {:02}:{:02}",
        MONTHS[(month - 1) as usize],
        day,
        year,
        hour,
        minute
    )
}

/// Convert days since 1970-01-01 to (year, month, day) in the proleptic
/// Gregorian calendar.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };
    (
        year,
        u32::try_from(month).unwrap_or(1),
        u32::try_from(day).unwrap_or(1),
    )
}
