//! `ultask`: inspect and manipulate a running process.
//!
//! Thin adapter over the ulpatch library: flags parse here, everything else
//! happens in the core. Addresses accept `0x…` hex or decimal; sizes accept
//! `NN[KMG]B`.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;

use clap::{ArgAction, Parser};
use console::style;
use itertools::Itertools;
use log::debug;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags};

use ulpatch::arch::native;
use ulpatch::target::vma::{align_up, page_size};
use ulpatch::{OpenFlags, Patch, Task, patch, remove_patch};

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid address `{s}`"))
}

fn parse_size(s: &str) -> Result<u64, String> {
    let upper = s.to_ascii_uppercase();
    let (digits, unit) = match upper.as_bytes() {
        [head @ .., b'K', b'B'] => (head, 1u64 << 10),
        [head @ .., b'M', b'B'] => (head, 1 << 20),
        [head @ .., b'G', b'B'] => (head, 1 << 30),
        [head @ .., b'B'] => (head, 1),
        _ => (upper.as_bytes(), 1),
    };
    std::str::from_utf8(digits)
        .ok()
        .and_then(|d| d.parse::<u64>().ok())
        .map(|n| n * unit)
        .ok_or_else(|| format!("invalid size `{s}`"))
}

/// `vma,addr=0x7f...[,size=4KB]`
#[derive(Debug, Clone)]
struct DumpSpec {
    addr: u64,
    size: Option<u64>,
}

impl FromStr for DumpSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = None;
        let mut size = None;
        for part in s.split(',') {
            match part.split_once('=') {
                None if part == "vma" => {}
                Some(("addr", v)) => addr = Some(parse_addr(v)?),
                Some(("size", v)) => size = Some(parse_size(v)?),
                _ => return Err(format!("unknown dump field `{part}`")),
            }
        }
        Ok(DumpSpec {
            addr: addr.ok_or("dump spec needs addr=")?,
            size,
        })
    }
}

/// `file=/path[,ro][,noexec]`
#[derive(Debug, Clone)]
struct MapSpec {
    file: PathBuf,
    ro: bool,
    noexec: bool,
}

impl FromStr for MapSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut file = None;
        let mut ro = false;
        let mut noexec = false;
        for part in s.split(',') {
            match part.split_once('=') {
                Some(("file", v)) => file = Some(PathBuf::from(v)),
                None if part == "ro" => ro = true,
                None if part == "noexec" => noexec = true,
                _ => return Err(format!("unknown map field `{part}`")),
            }
        }
        Ok(MapSpec {
            file: file.ok_or("map spec needs file=")?,
            ro,
            noexec,
        })
    }
}

/// `from=ADDR,to=ADDR`
#[derive(Debug, Clone)]
struct JmpSpec {
    from: u64,
    to: u64,
}

impl FromStr for JmpSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut from = None;
        let mut to = None;
        for part in s.split(',') {
            match part.split_once('=') {
                Some(("from", v)) => from = Some(parse_addr(v)?),
                Some(("to", v)) => to = Some(parse_addr(v)?),
                _ => return Err(format!("unknown jmp field `{part}`")),
            }
        }
        Ok(JmpSpec {
            from: from.ok_or("jmp spec needs from=")?,
            to: to.ok_or("jmp spec needs to=")?,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "ultask", version, about = "Inspect and manipulate a running process")]
struct Cli {
    /// Target process id
    #[arg(short, long, env = "ULPATCH_PID")]
    pid: i32,

    /// List the target's memory mappings
    #[arg(long)]
    vmas: bool,

    /// List the target's threads
    #[arg(long)]
    threads: bool,

    /// List the target's open file descriptors
    #[arg(long)]
    fds: bool,

    /// List the symbols resolved in the target, with runtime addresses
    #[arg(long)]
    syms: bool,

    /// Print the target's /proc status
    #[arg(long)]
    status: bool,

    /// Dump the mapping covering an address: `vma,addr=0x7f...`
    /// (use -o to choose the output file)
    #[arg(long, value_name = "SPEC")]
    dump: Option<DumpSpec>,

    /// Map a file into the target: `file=/path[,ro][,noexec]`
    #[arg(long, value_name = "SPEC")]
    map: Option<MapSpec>,

    /// Unmap the mapping covering ADDR
    #[arg(long, value_name = "ADDR", value_parser = parse_addr)]
    unmap: Option<u64>,

    /// Poke an unconditional jump: `from=ADDR,to=ADDR`
    #[arg(long, value_name = "SPEC")]
    jmp: Option<JmpSpec>,

    /// Load and activate a patch object in the target
    #[arg(long, value_name = "FILE")]
    patch: Option<PathBuf>,

    /// Remove a previously installed patch
    #[arg(long, value_name = "FILE")]
    unpatch: Option<PathBuf>,

    /// Write listings (or --dump bytes) to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Raise verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::builder()
        .parse_env(env_logger::Env::new().filter_or("ULPATCH_LOG", default_level))
        .format_timestamp(None)
        .init();

    if let Err(err) = run(cli) {
        for cause in err.chain() {
            eprintln!("{} {}", style("Error:").bold().red(), style(cause).red());
        }
        std::process::exit(exit_code(&err));
    }
}

/// Exit with the target-side errno where one is known, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(remote) = cause.downcast_ref::<ulpatch::error::RemoteError>() {
            return remote.errno;
        }
        if let Some(errno) = cause.downcast_ref::<nix::errno::Errno>() {
            return *errno as i32;
        }
        if let Some(code) = cause
            .downcast_ref::<io::Error>()
            .and_then(io::Error::raw_os_error)
        {
            return code;
        }
    }
    1
}

fn open_flags(cli: &Cli) -> OpenFlags {
    let mut flags = OpenFlags::LOAD_VMAS;
    if cli.map.is_some() || cli.unmap.is_some() || cli.jmp.is_some() || cli.unpatch.is_some() {
        flags = flags | OpenFlags::RDWR;
    }
    if cli.syms {
        flags = flags | OpenFlags::LOAD_VMA_ELFS | OpenFlags::LOAD_SYMBOLS;
    }
    if cli.patch.is_some() {
        flags = flags | OpenFlags::for_patching();
    }
    if cli.unpatch.is_some() {
        flags = flags | OpenFlags::REGISTER_ON_DISK;
    }
    flags
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut task = Task::open(cli.pid, open_flags(&cli))?;
    debug!("attached to pid {} ({})", task.pid(), task.comm());

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };

    if cli.vmas {
        for vma in task.vmas().iter() {
            writeln!(
                out,
                "{:016x}-{:016x} {} {:08x} {}",
                vma.start,
                vma.end,
                vma.perms,
                vma.offset,
                vma.name.display()
            )?;
        }
    }

    if cli.threads {
        for tid in task.threads()? {
            writeln!(out, "{tid}")?;
        }
    }

    if cli.fds {
        for (fd, target) in task.fds()? {
            writeln!(out, "{fd} -> {target}")?;
        }
    }

    if cli.status {
        let status = std::fs::read_to_string(format!("/proc/{}/status", task.pid()))?;
        out.write_all(status.as_bytes())?;
    }

    if cli.syms {
        for sym in task.symbols().iter().sorted_by_key(|s| s.value) {
            let addr = ulpatch::symbols::runtime_addr(task.vmas(), sym).unwrap_or(sym.value);
            writeln!(out, "{addr:016x} {:6} {}", sym.size, sym.name)?;
        }
    }

    if let Some(dump) = &cli.dump {
        let bytes = task.dump_vma(dump.addr)?;
        let take = dump.size.map(|s| s as usize).unwrap_or(bytes.len());
        out.write_all(&bytes[..take.min(bytes.len())])?;
    }

    if let Some(map) = &cli.map {
        let fd = task.remote_open(&map.file, OFlag::O_RDONLY, 0)?;
        let st = task.remote_fstat(fd)?;
        let mut prot = ProtFlags::PROT_READ;
        if !map.ro {
            prot |= ProtFlags::PROT_WRITE;
        }
        if !map.noexec {
            prot |= ProtFlags::PROT_EXEC;
        }
        let base = task.remote_mmap(0, st.st_size as usize, prot, MapFlags::MAP_PRIVATE, fd, 0)?;
        task.remote_close(fd)?;
        task.update_vmas()?;
        writeln!(out, "{base:#x}")?;
    }

    if let Some(addr) = cli.unmap {
        let index = task
            .vmas()
            .find_vma(addr)
            .ok_or_else(|| anyhow::anyhow!("no mapping covers {addr:#x}"))?;
        let (start, size) = {
            let vma = task.vmas().get(index);
            (vma.start, vma.size() as usize)
        };
        task.remote_munmap(start, size)?;
        task.update_vmas()?;
    }

    if let Some(jmp) = &cli.jmp {
        let index = task
            .vmas()
            .find_vma(jmp.from)
            .ok_or_else(|| anyhow::anyhow!("no mapping covers {:#x}", jmp.from))?;
        let perms = task.vmas().get(index).perms;
        if !perms.write || !perms.exec {
            // Read-only text: make the poked range writable and executable
            // in the target before the branch goes in.
            let page = page_size();
            let start = jmp.from & !(page - 1);
            let end = align_up(jmp.from + native::MCOUNT_INSN_SIZE as u64, page);
            task.remote_mprotect(
                start,
                (end - start) as usize,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            )?;
            task.update_vmas()?;
        }
        let original = patch::install::poke_jump(&mut task, jmp.from, jmp.to)?;
        debug!("overwrote {original:02x?} at {:#x}", jmp.from);
    }

    if let Some(path) = &cli.patch {
        Patch::load(&mut task, path)?;
    }

    if let Some(path) = &cli.unpatch {
        remove_patch(&mut task, path)?;
    }

    task.close()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_parse_hex_and_decimal() {
        assert_eq!(parse_addr("0x7f00dead").unwrap(), 0x7f00_dead);
        assert_eq!(parse_addr("4096").unwrap(), 4096);
        assert!(parse_addr("0xzz").is_err());
        assert!(parse_addr("").is_err());
    }

    #[test]
    fn sizes_accept_unit_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4KB").unwrap(), 4096);
        assert_eq!(parse_size("2MB").unwrap(), 2 << 20);
        assert_eq!(parse_size("1GB").unwrap(), 1 << 30);
        assert_eq!(parse_size("512B").unwrap(), 512);
        assert_eq!(parse_size("1kb").unwrap(), 1024);
        assert!(parse_size("KB").is_err());
    }

    #[test]
    fn dump_spec_parses() {
        let spec: DumpSpec = "vma,addr=0x7f0000001000,size=4KB".parse().unwrap();
        assert_eq!(spec.addr, 0x7f00_0000_1000);
        assert_eq!(spec.size, Some(4096));
        assert!("size=4KB".parse::<DumpSpec>().is_err());
    }

    #[test]
    fn map_and_jmp_specs_parse() {
        let map: MapSpec = "file=/tmp/x.so,ro,noexec".parse().unwrap();
        assert_eq!(map.file, PathBuf::from("/tmp/x.so"));
        assert!(map.ro && map.noexec);
        assert!("ro".parse::<MapSpec>().is_err());

        let jmp: JmpSpec = "from=0x1000,to=0x2000".parse().unwrap();
        assert_eq!((jmp.from, jmp.to), (0x1000, 0x2000));
        assert!("from=0x1000".parse::<JmpSpec>().is_err());
    }

    #[test]
    fn cli_parses_a_full_invocation() {
        let cli = Cli::try_parse_from([
            "ultask",
            "-p",
            "1234",
            "--vmas",
            "--syms",
            "--jmp",
            "from=0x1000,to=0x2000",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.pid, 1234);
        assert!(cli.vmas && cli.syms);
        assert_eq!(cli.verbose, 2);
        assert!(open_flags(&cli).contains(OpenFlags::RDWR));
        assert!(open_flags(&cli).contains(OpenFlags::LOAD_SYMBOLS));
    }
}
