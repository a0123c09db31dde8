use crate::core::GpuId;
use anyhow::{Context, Result};
use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};
use range_parser::parse;

/// Parse GPU indices string into a sorted, deduplicated list.
///
/// Supported formats:
/// - Single index: `"0"`
/// - Comma-separated: `"0,2,4"`
/// - Range: `"0-3"`
/// - Mixed: `"0-1,3"`
///
/// # Examples
///
/// ```
/// use cudaq::utils::parse_gpu_indices;
///
/// assert_eq!(parse_gpu_indices("0").unwrap(), vec![0]);
/// assert_eq!(parse_gpu_indices("3,1").unwrap(), vec![1, 3]);
/// assert_eq!(parse_gpu_indices("0-1,3").unwrap(), vec![0, 1, 3]);
/// ```
pub fn parse_gpu_indices(gpu_string: &str) -> Result<Vec<GpuId>> {
    let mut parsed: Vec<GpuId> = parse::<GpuId>(gpu_string.trim())
        .with_context(|| format!("Invalid GPU index or range: {gpu_string}"))?;

    parsed.sort_unstable();
    parsed.dedup();

    Ok(parsed)
}

/// Shorten a command for table display, keeping the start.
pub fn truncate_command(command: &str, max_chars: usize) -> String {
    if command.chars().count() <= max_chars {
        return command.to_string();
    }
    let kept: String = command.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());
