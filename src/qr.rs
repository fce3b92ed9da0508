//! QR code generation for terminal display
//!
//! Renders the pairing payload so the mobile app can scan it.

use crate::error::{LinkError, Result};
use crate::pairing::{render_as_scannable, PairingInfo};
use colored::Colorize;
use qrcode::QrCode;

/// Render `data` as a block-character QR code
pub fn render(data: &str) -> Result<String> {
    let code = QrCode::new(data.as_bytes()).map_err(|e| LinkError::Qr(e.to_string()))?;

    // Unicode block characters, two columns per module to keep it square
    Ok(code
        .render::<char>()
        .quiet_zone(true)
        .module_dimensions(2, 1)
        .build())
}

/// Print connection info and the pairing QR code
pub fn display_pairing(info: &PairingInfo) -> Result<()> {
    let qr = render(&render_as_scannable(info))?;

    println!();
    println!("{}", "--- crosslink pairing ---".cyan().bold());
    println!("  {} {}", "LAN IP:".dimmed(), info.server_ip.yellow());
    println!("  {} {}", "Port:".dimmed(), info.port.to_string().yellow());
    println!("  {} {}", "Pairing token:".dimmed(), info.pairing_token.green());
    println!();

    for line in qr.lines() {
        println!("  {}", line);
    }

    println!();
    println!(
        "{}",
        "Scan with the crosslink app. Your phone must be on the same network.".dimmed()
    );
    println!("{}", "--- Waiting for a device to connect... ---".dimmed());
    println!();
    Ok(())
}
