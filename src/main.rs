use anyhow::{Context, Result};
use clap::Parser;
use pcap_parser::pcapng::Block;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::*;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(author, version, about = "Produce a privacy-filtered copy of a pcap dataset: mirrors the source directory tree and drops purely-local traffic from every capture.")]
struct Args {
    /// Root of the original, unfiltered dataset
    source_root: PathBuf,

    /// Root under which the filtered dataset is written
    destination_root: PathBuf,

    /// Regex selecting capture files by full path, replacing the default
    /// .pcap/.pcapng extension match (repeatable)
    #[arg(long = "pattern", short = 'p')]
    patterns: Vec<String>,

    /// Print the batch outcome as JSON to stdout
    #[arg(long, default_value_t = false)]
    report: bool,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

// ─── Capture-file policy ──────────────────────────────────────────────────────

/// Default eligibility: a regular file named *.pcap or *.pcapng,
/// compared case-sensitively.
fn default_policy(path: &Path, meta: &fs::Metadata) -> bool {
    meta.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".pcap") || n.ends_with(".pcapng"))
}

fn pattern_policy(patterns: &[Regex], path: &Path, meta: &fs::Metadata) -> bool {
    meta.is_file() && patterns.iter().any(|re| re.is_match(&path.to_string_lossy()))
}

fn compile_patterns(raw: &[String]) -> Result<Vec<Regex>> {
    raw.iter()
        .map(|p| Regex::new(p).with_context(|| format!("Invalid pattern: {p}")))
        .collect()
}

// ─── Fileset discovery ────────────────────────────────────────────────────────

/// Recursively identifies all eligible capture files under `source_root` and
/// translates their paths respective to `destination_root`, so that the file
/// hierarchy below the source root is preserved under the destination root.
///
/// Discovery is all-or-nothing: any I/O error during the walk fails the whole
/// call and no partial mapping is returned.
fn discover<F>(
    source_root: &Path,
    destination_root: &Path,
    policy: F,
) -> Result<HashMap<PathBuf, PathBuf>>
where
    F: Fn(&Path, &fs::Metadata) -> bool,
{
    let meta = fs::metadata(source_root)
        .with_context(|| format!("Cannot read {:?}", source_root))?;
    if !meta.is_dir() {
        return Err(anyhow::anyhow!("{:?} is not a directory", source_root));
    }
    let mut mappings = HashMap::new();
    walk_tree(source_root, source_root, destination_root, &policy, &mut mappings)?;
    Ok(mappings)
}

fn walk_tree<F>(
    dir: &Path,
    source_root: &Path,
    destination_root: &Path,
    policy: &F,
    mappings: &mut HashMap<PathBuf, PathBuf>,
) -> Result<()>
where
    F: Fn(&Path, &fs::Metadata) -> bool,
{
    for entry in fs::read_dir(dir).with_context(|| format!("Cannot list {:?}", dir))? {
        let entry = entry.with_context(|| format!("Cannot list {:?}", dir))?;
        let path = entry.path();
        let meta = entry
            .metadata()
            .with_context(|| format!("Cannot stat {:?}", path))?;
        if policy(&path, &meta) {
            let relative = path
                .strip_prefix(source_root)
                .with_context(|| format!("{:?} is not below {:?}", path, source_root))?;
            mappings.insert(path.clone(), destination_root.join(relative));
        }
        if meta.is_dir() {
            walk_tree(&path, source_root, destination_root, policy, mappings)?;
        }
    }
    Ok(())
}

// ─── Traffic classification ───────────────────────────────────────────────────

/// IP endpoints of one packet, as far as the capture's link layer lets us see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpEndpoints {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
    NonIp,
}

fn is_site_local_v4(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 10 || (o[0] == 172 && (16..=31).contains(&o[1])) || (o[0] == 192 && o[1] == 168)
}

fn is_site_local_v6(addr: Ipv6Addr) -> bool {
    let b = addr.octets();
    // Unique-local fc00::/7 or site-local fec0::/10.
    (b[0] & 0xfe) == 0xfc || (b[0] == 0xfe && (b[1] & 0xc0) == 0xc0)
}

/// Decides whether a packet survives into the filtered output. Rules are
/// checked in order; the first match wins.
fn should_keep(endpoints: IpEndpoints) -> bool {
    match endpoints {
        // Not IP traffic. Include packet.
        IpEndpoints::NonIp => true,
        IpEndpoints::V4 { src, dst } => {
            if is_site_local_v4(src) && is_site_local_v4(dst) {
                // Both endpoints are in local address spaces. Discard.
                return false;
            }
            if src.is_unspecified() || dst.is_unspecified() {
                // 0.0.0.0 source or destination, e.g. pre-lease DHCP requests.
                return false;
            }
            if dst.is_broadcast() || src.is_broadcast() {
                // Limited broadcast 255.255.255.255.
                return false;
            }
            // At least one endpoint has a global address. Include packet.
            true
        }
        // The zero-network and broadcast rules cover IPv4 only; for IPv6 the
        // local/local rule is the sole discard condition.
        IpEndpoints::V6 { src, dst } => !(is_site_local_v6(src) && is_site_local_v6(dst)),
    }
}

// ─── Packet parsing ───────────────────────────────────────────────────────────

// Link-layer header types from the pcap LINKTYPE registry.
const LINKTYPE_NULL: i32 = 0;
const LINKTYPE_ETHERNET: i32 = 1;
const LINKTYPE_RAW: i32 = 101;
const LINKTYPE_IPV4: i32 = 228;
const LINKTYPE_IPV6: i32 = 229;

fn extract_endpoints(linktype: Linktype, raw: &[u8]) -> IpEndpoints {
    match linktype.0 {
        LINKTYPE_ETHERNET => {
            if raw.len() < 14 {
                return IpEndpoints::NonIp;
            }
            let ethertype = u16::from_be_bytes([raw[12], raw[13]]);
            match ethertype {
                0x0800 | 0x86DD => ip_endpoints(&raw[14..]),
                0x8100 if raw.len() >= 18 => ip_endpoints(&raw[18..]),
                _ => IpEndpoints::NonIp,
            }
        }
        // BSD loopback: a 4-byte address-family word, then the IP header.
        LINKTYPE_NULL if raw.len() >= 4 => ip_endpoints(&raw[4..]),
        LINKTYPE_RAW | LINKTYPE_IPV4 | LINKTYPE_IPV6 => ip_endpoints(raw),
        _ => IpEndpoints::NonIp,
    }
}

fn ip_endpoints(raw: &[u8]) -> IpEndpoints {
    match raw.first().map(|b| b >> 4) {
        Some(4) if raw.len() >= 20 => IpEndpoints::V4 {
            src: Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]),
            dst: Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19]),
        },
        Some(6) if raw.len() >= 40 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&raw[8..24]);
            dst.copy_from_slice(&raw[24..40]);
            IpEndpoints::V6 {
                src: Ipv6Addr::from(src),
                dst: Ipv6Addr::from(dst),
            }
        }
        _ => IpEndpoints::NonIp,
    }
}

// ─── pcap I/O ─────────────────────────────────────────────────────────────────

const OUTPUT_SNAPLEN: u32 = 65535;

/// One packet record as read from a capture, owned so it outlives the
/// reader's buffer window.
struct RawRecord {
    ts_sec:   u32,
    ts_usec:  u32,
    origlen:  u32,
    linktype: Linktype,
    data:     Vec<u8>,
}

fn write_global_header(w: &mut impl Write, linktype: Linktype) -> Result<()> {
    w.write_all(&0xa1b2c3d4u32.to_le_bytes())?;
    w.write_all(&2u16.to_le_bytes())?;
    w.write_all(&4u16.to_le_bytes())?;
    w.write_all(&0i32.to_le_bytes())?;
    w.write_all(&0u32.to_le_bytes())?;
    w.write_all(&OUTPUT_SNAPLEN.to_le_bytes())?;
    w.write_all(&(linktype.0 as u32).to_le_bytes())?;
    Ok(())
}

fn write_packet(w: &mut impl Write, ts_sec: u32, ts_usec: u32, origlen: u32, data: &[u8]) -> Result<()> {
    w.write_all(&ts_sec.to_le_bytes())?;
    w.write_all(&ts_usec.to_le_bytes())?;
    w.write_all(&(data.len() as u32).to_le_bytes())?;
    w.write_all(&origlen.to_le_bytes())?;
    w.write_all(data)?;
    Ok(())
}

/// Splits a pcapng 64-bit timestamp into legacy seconds/microseconds.
/// `if_tsresol` follows the interface option encoding: high bit clear means
/// 10^-n units, high bit set means 2^-n units, microseconds when absent.
/// Sub-microsecond binary resolutions are truncated toward zero.
fn split_ng_timestamp(ts_high: u32, ts_low: u32, if_tsresol: u8) -> (u32, u32) {
    let ticks = ((ts_high as u64) << 32) | ts_low as u64;
    let per_sec: u64 = if if_tsresol & 0x80 != 0 {
        1u64 << (if_tsresol & 0x7f).min(63)
    } else {
        10u64.saturating_pow((if_tsresol & 0x7f) as u32)
    };
    let per_sec = per_sec.max(1);
    let sec = ticks / per_sec;
    let frac = ticks % per_sec;
    let usec = if per_sec >= 1_000_000 {
        frac / (per_sec / 1_000_000).max(1)
    } else {
        frac * (1_000_000 / per_sec)
    };
    (sec as u32, usec as u32)
}

#[derive(Debug, Default, Clone, Copy)]
struct FilterStats {
    packets_total:     u64,
    packets_kept:      u64,
    packets_discarded: u64,
}

/// Filters one capture file: reads `source` (legacy pcap or pcapng), keeps
/// every packet that passes the classifier, and writes kept records with
/// verbatim bytes and timestamps to `destination` as legacy pcap. The
/// dataset's captures carry no data-link framing, so the output header type
/// is fixed at RAW rather than copied from the input.
fn filter_capture(source: &Path, destination: &Path) -> Result<FilterStats> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Cannot create {:?}", parent))?;
    }
    let file = File::open(source).with_context(|| format!("Cannot open {:?}", source))?;
    let out_file =
        File::create(destination).with_context(|| format!("Cannot create {:?}", destination))?;
    let mut writer = BufWriter::new(out_file);
    write_global_header(&mut writer, Linktype::RAW)?;

    let mut reader = create_reader(65536, BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("not a valid capture file: {:?}", e))?;
    let mut stats = FilterStats::default();
    let mut legacy_linktype = Linktype::RAW;
    // pcapng interfaces in declaration order: (linktype, if_tsresol).
    let mut interfaces: Vec<(Linktype, u8)> = Vec::new();

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let rec: Option<RawRecord> = match block {
                    PcapBlockOwned::LegacyHeader(ref hdr) => {
                        legacy_linktype = hdr.network;
                        None
                    }
                    PcapBlockOwned::Legacy(ref b) => Some(RawRecord {
                        ts_sec:   b.ts_sec,
                        ts_usec:  b.ts_usec,
                        origlen:  b.origlen,
                        linktype: legacy_linktype,
                        data:     b.data.to_vec(),
                    }),
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        interfaces.clear();
                        None
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(ref idb)) => {
                        interfaces.push((idb.linktype, idb.if_tsresol));
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(ref epb)) => {
                        let (linktype, tsresol) = interfaces
                            .get(epb.if_id as usize)
                            .copied()
                            .unwrap_or((Linktype::RAW, 6));
                        let (ts_sec, ts_usec) =
                            split_ng_timestamp(epb.ts_high, epb.ts_low, tsresol);
                        // epb.data may carry 32-bit alignment padding.
                        let caplen = (epb.caplen as usize).min(epb.data.len());
                        Some(RawRecord {
                            ts_sec,
                            ts_usec,
                            origlen: epb.origlen,
                            linktype,
                            data: epb.data[..caplen].to_vec(),
                        })
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(ref spb)) => {
                        let (linktype, _) =
                            interfaces.first().copied().unwrap_or((Linktype::RAW, 6));
                        // Simple packet blocks carry no timestamp.
                        let caplen = (spb.origlen as usize).min(spb.data.len());
                        Some(RawRecord {
                            ts_sec:  0,
                            ts_usec: 0,
                            origlen: spb.origlen,
                            linktype,
                            data: spb.data[..caplen].to_vec(),
                        })
                    }
                    PcapBlockOwned::NG(_) => None,
                };
                drop(block);
                reader.consume(offset);

                if let Some(rec) = rec {
                    stats.packets_total += 1;
                    if should_keep(extract_endpoints(rec.linktype, &rec.data)) {
                        write_packet(&mut writer, rec.ts_sec, rec.ts_usec, rec.origlen, &rec.data)?;
                        stats.packets_kept += 1;
                    } else {
                        stats.packets_discarded += 1;
                    }
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                if let Err(e) = reader.refill() {
                    return Err(anyhow::anyhow!("refill error: {:?}", e));
                }
            }
            Err(e) => return Err(anyhow::anyhow!("capture parse error: {:?}", e)),
        }
    }

    writer.flush()?;
    Ok(stats)
}

// ─── Batch pipeline ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum Outcome {
    Filtered {
        packets_total:     u64,
        packets_kept:      u64,
        packets_discarded: u64,
    },
    SkippedDirectory,
    Failed {
        error: String,
    },
}

#[derive(Debug, Serialize)]
struct FileReport {
    source:      PathBuf,
    destination: PathBuf,
    #[serde(flatten)]
    outcome:     Outcome,
}

/// Processes every mapping in turn. A failure on one file never aborts the
/// batch; each file gets its own outcome.
fn run_batch(mappings: &HashMap<PathBuf, PathBuf>) -> Vec<FileReport> {
    let mut reports = Vec::with_capacity(mappings.len());
    for (source, destination) in mappings {
        info!("Source: {}", source.display());
        info!("Target: {}", destination.display());
        let outcome = if destination.is_dir() {
            warn!("{} is a directory. Expected a file. Skipping.", destination.display());
            Outcome::SkippedDirectory
        } else {
            match filter_capture(source, destination) {
                Ok(stats) => {
                    debug!(
                        "kept {}/{} packets from {}",
                        stats.packets_kept,
                        stats.packets_total,
                        source.display()
                    );
                    Outcome::Filtered {
                        packets_total:     stats.packets_total,
                        packets_kept:      stats.packets_kept,
                        packets_discarded: stats.packets_discarded,
                    }
                }
                Err(e) => {
                    warn!("Failed to filter {}: {:#}", source.display(), e);
                    Outcome::Failed { error: format!("{:#}", e) }
                }
            }
        };
        reports.push(FileReport {
            source:      source.clone(),
            destination: destination.clone(),
            outcome,
        });
    }
    reports
}

#[derive(Debug, Default, Serialize)]
struct BatchSummary {
    files_discovered:  u64,
    files_filtered:    u64,
    files_skipped:     u64,
    files_failed:      u64,
    packets_kept:      u64,
    packets_discarded: u64,
}

fn summarize(reports: &[FileReport]) -> BatchSummary {
    let mut summary = BatchSummary {
        files_discovered: reports.len() as u64,
        ..Default::default()
    };
    for report in reports {
        match &report.outcome {
            Outcome::Filtered { packets_kept, packets_discarded, .. } => {
                summary.files_filtered += 1;
                summary.packets_kept += packets_kept;
                summary.packets_discarded += packets_discarded;
            }
            Outcome::SkippedDirectory => summary.files_skipped += 1,
            Outcome::Failed { .. } => summary.files_failed += 1,
        }
    }
    summary
}

// ─── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(log_level).with_target(false).with_writer(std::io::stderr).init();

    let patterns = compile_patterns(&args.patterns)?;
    let policy = move |path: &Path, meta: &fs::Metadata| {
        if patterns.is_empty() {
            default_policy(path, meta)
        } else {
            pattern_policy(&patterns, path, meta)
        }
    };

    info!("Scanning {:?}", args.source_root);
    let mappings = discover(&args.source_root, &args.destination_root, policy)?;
    info!("Discovered {} capture files", mappings.len());

    let reports = run_batch(&mappings);
    let summary = summarize(&reports);

    if args.report {
        let report = serde_json::json!({ "summary": summary, "files": reports });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("=== Filter Summary ===");
        println!("Files discovered:    {}", summary.files_discovered);
        println!("Files filtered:      {}", summary.files_filtered);
        println!("Files skipped:       {}", summary.files_skipped);
        println!("Files failed:        {}", summary.files_failed);
        println!("Packets kept:        {}", summary.packets_kept);
        println!("Packets discarded:   {}", summary.packets_discarded);
    }

    // Per-file failures are reported above, not propagated into the exit code.
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
