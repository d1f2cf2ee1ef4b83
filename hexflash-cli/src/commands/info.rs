//! Image info command implementation.

use {
    crate::{Cli, commands::flash::FlashSettings, config::Config},
    anyhow::{Context, Result},
    console::style,
    hexflash::{HexImage, ProtocolKind, StartAddress, loader::chunks},
    std::path::Path,
};

fn start_address_string(start: Option<StartAddress>) -> Option<String> {
    start.map(|s| match s {
        StartAddress::Segment { cs, ip } => format!("{cs:04x}:{ip:04x}"),
        StartAddress::Linear(addr) => format!("{addr:08x}"),
    })
}

/// Build the JSON document for `info --json`.
pub(crate) fn info_json(image: &HexImage, protocol: ProtocolKind) -> serde_json::Value {
    let max = protocol.max_chunk();
    let segments: Vec<serde_json::Value> = image
        .segments()
        .iter()
        .map(|s| {
            serde_json::json!({
                "start": s.start,
                "end": s.end(),
                "len": s.len(),
                "chunks": chunks(s, max).count(),
            })
        })
        .collect();
    let fits = protocol.check_image(image);

    serde_json::json!({
        "ok": true,
        "data": {
            "protocol": protocol,
            "max_chunk": max,
            "total_bytes": image.len(),
            "start_address": start_address_string(image.start_address()),
            "fits": fits.is_ok(),
            "segments": segments,
        }
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, image_path: &Path, json: bool) -> Result<()> {
    let protocol = FlashSettings::resolve(cli, config)?.protocol;
    let image = HexImage::from_file(image_path)
        .with_context(|| format!("Failed to load image {}", image_path.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info_json(&image, protocol))?
        );
        return Ok(());
    }

    eprintln!(
        "\n{}",
        style("Image Information")
            .bold()
            .underlined()
    );
    eprintln!("  File: {}", image_path.display());
    eprintln!("  Total: {} bytes", image.len());
    if let Some(start) = start_address_string(image.start_address()) {
        eprintln!("  Start address: {start}");
    }

    eprintln!(
        "\n{}",
        style(format!(
            "Segments ({protocol} protocol, {} byte chunks):",
            protocol.max_chunk()
        ))
        .bold()
    );
    for segment in image.segments() {
        eprintln!(
            "  {} ${:04x}..${:04x} {:>7} bytes {:>5} chunk(s)",
            style("•").dim(),
            segment.start,
            segment.end(),
            segment.len(),
            chunks(segment, protocol.max_chunk()).count()
        );
    }

    if let Err(e) = protocol.check_image(&image) {
        eprintln!("\n  {} {e}", style("⚠").yellow());
    }

    Ok(())
}
