use anyhow::{Context, Result, bail};
use clap::Parser;

use osap_wire::{INSTRUCTION_START, Key, find_ptr, read_arg, read_seg_size, read_ttl};

/// Decode a hex OSAP datagram into a readable listing.
///
/// Bytes are given as hex, whitespace optional: `e803 8000 f0 e0 c0 4d`.
#[derive(Parser)]
struct Cmdline {
    /// The datagram, hex encoded
    gram: String,
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let clean: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if clean.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..clean.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&clean[i..i + 2], 16).context("bad hex digit"))
        .collect()
}

fn pair_line(gram: &[u8], at: usize) -> String {
    let key = Key::from_byte(gram[at]);
    let arg = read_arg(gram, at).unwrap_or(0);
    match key {
        Some(key) => format!("{at:3}  {key}({arg})"),
        None => format!("{at:3}  ?? {:#04x}", gram[at]),
    }
}

fn main() -> Result<()> {
    let Cmdline { gram } = Cmdline::parse();
    let gram = parse_hex(&gram)?;

    let ttl = read_ttl(&gram).context("datagram shorter than its header")?;
    let seg_size = read_seg_size(&gram).context("datagram shorter than its header")?;
    println!("ttl {ttl}ms  seg {seg_size}  len {}", gram.len());

    let ptr = find_ptr(&gram).context("no pointer marker in the instruction region")?;

    println!("trail:");
    if ptr == INSTRUCTION_START {
        println!("     (empty)");
    }
    let mut at = INSTRUCTION_START;
    while at < ptr {
        println!("{}", pair_line(&gram, at));
        at += 2;
    }

    println!("{ptr:3}  ptr");

    println!("plan:");
    at = ptr + 1;
    while at < gram.len() {
        match Key::from_byte(gram[at]) {
            Some(key) if key.is_hop() => {
                println!("{}", pair_line(&gram, at));
                at += 2;
            }
            Some(key) => {
                println!("{at:3}  {key}");
                at += 1;
                break;
            }
            None => break,
        }
    }
    if at < gram.len() {
        let bytes: Vec<String> = gram[at..].iter().map(|b| format!("{b:02x}")).collect();
        println!("payload ({} bytes): {}", gram.len() - at, bytes.join(" "));
    }
    Ok(())
}
