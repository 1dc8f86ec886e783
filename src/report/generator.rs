//! Human-readable rendering of packets, verification results and status.
//!
//! JSON output goes through [`generate_json`]; everything else is plain
//! text meant for a terminal.

use crate::chain::ChainStats;
use crate::identity::IdentityStats;
use crate::models::{ProofPacket, VerificationReport};
use crate::orchestrator::OrchestratorStats;
use crate::time::TimeStats;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

fn mark(ok: bool) -> &'static str {
    if ok {
        "✅"
    } else {
        "❌"
    }
}

fn short(hash: &str) -> String {
    if hash.len() > 16 && hash.is_ascii() {
        format!("{}…{}", &hash[..8], &hash[hash.len() - 8..])
    } else {
        hash.to_string()
    }
}

/// Summarize a packet.
pub fn render_packet(packet: &ProofPacket) -> String {
    let mut output = String::new();

    output.push_str(&format!("📦 Packet #{}\n", packet.sequence_number));
    output.push_str(&format!("   Timestamp: {}\n", packet.timestamp));
    output.push_str(&format!("   Identity:  {}\n", short(&packet.identity_hash)));

    if packet.blockchain_hashes.is_empty() {
        output.push_str("   Chains:    (none available)\n");
    } else {
        for (chain, hash) in &packet.blockchain_hashes {
            output.push_str(&format!("   {:<10} {}\n", format!("{}:", chain), short(hash)));
        }
    }

    output.push_str(&format!(
        "   Time sources: {}\n",
        packet.time_server_verification.len()
    ));
    for (source, entry) in &packet.time_server_verification {
        output.push_str(&format!("     - {} ({:+.4}s)\n", source, entry.offset));
    }

    if let Some(user_data) = &packet.user_data {
        output.push_str(&format!("   User data: {}\n", user_data));
    }

    output
}

/// Render the outcome of a verification.
pub fn render_verification(report: &VerificationReport) -> String {
    let mut output = String::new();

    if !report.valid_json {
        output.push_str("❌ Not a valid packet\n");
        if let Some(error) = &report.error {
            output.push_str(&format!("   {}\n", error));
        }
        return output;
    }

    output.push_str("🔍 Verification\n");
    output.push_str(&format!("   {} Identity\n", mark(report.identity_verified)));
    output.push_str(&format!("   {} Timestamp\n", mark(report.time_verified)));
    if report.chains_in_packet == 0 {
        output.push_str("   ➖ Blockchain (no chains in packet)\n");
    } else {
        output.push_str(&format!(
            "   {} Blockchain ({} chains in packet)\n",
            mark(report.blockchain_verified),
            report.chains_in_packet
        ));
    }

    let valid = report.overall_valid();
    output.push_str(&format!(
        "\n{} Overall: {}\n",
        mark(valid),
        if valid { "VALID" } else { "INVALID" }
    ));

    output
}

/// Render component statistics.
pub fn render_status(stats: &OrchestratorStats) -> String {
    let mut output = String::new();

    output.push_str("## Orchestrator\n");
    output.push_str(&format!("- Running: {}\n", stats.running));
    output.push_str(&format!("- Packets generated: {}\n", stats.packets_generated));
    output.push_str(&format!("- Observers: {}\n", stats.observers));

    output.push_str(&generate_time_section(&stats.time));
    output.push_str(&generate_chain_section(&stats.chains));
    output.push_str(&generate_identity_section(&stats.identity));

    output
}

fn generate_time_section(time: &TimeStats) -> String {
    let mut section = String::new();

    section.push_str("\n## Time\n");
    section.push_str(&format!(
        "- Syncs: {} ({} ok, {} failed, {:.0}% success)\n",
        time.total_syncs,
        time.successful_syncs,
        time.failed_syncs,
        time.success_rate * 100.0
    ));
    section.push_str(&format!("- Active sources: {}\n", time.active_sources));
    for (source, offset) in &time.offsets {
        section.push_str(&format!("  - {}: {:+.4}s\n", source, offset));
    }

    section
}

fn generate_chain_section(chains: &ChainStats) -> String {
    let mut section = String::new();

    section.push_str("\n## Chains\n");
    section.push_str(&format!(
        "- Requests: {} ({} ok, {} failed, {} coalesced)\n",
        chains.total_requests,
        chains.successful_requests,
        chains.failed_requests,
        chains.coalesced_requests
    ));
    let cached = if chains.cached_chains.is_empty() {
        "none".to_string()
    } else {
        chains.cached_chains.join(", ")
    };
    section.push_str(&format!("- Cached: {}\n", cached));

    section
}

fn generate_identity_section(identity: &IdentityStats) -> String {
    let mut section = String::new();

    section.push_str("\n## Identity\n");
    section.push_str(&format!("- Algorithm: {}\n", identity.algorithm));
    section.push_str(&format!("- Tracked files: {}\n", identity.file_count));
    section.push_str(&format!("- Custom fields: {}\n", identity.custom_field_count));
    section.push_str(&format!(
        "- Digest generations: {}\n",
        identity.digest_generations
    ));

    section
}

/// Pretty JSON for any serializable result.
pub fn generate_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(Into::into)
}

/// Write rendered output to a file.
pub fn write_output(content: &str, path: &Path) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write output to {}", path.display()))
}
