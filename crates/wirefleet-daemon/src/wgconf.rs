// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::fmt::{self, Write as _};
use std::net::Ipv4Addr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use qrcode::QrCode;
use qrcode::render::svg;
use thiserror::Error;

pub const PERSISTENT_KEEPALIVE: u16 = 25;

#[derive(Debug, Error)]
pub enum QrError {
    #[error("failed to encode QR code: {0}")]
    Encode(#[from] qrcode::types::QrError),
}

/// Inputs for a wg-quick client config.
#[derive(Debug, Clone)]
pub struct ClientConfig<'a> {
    pub name: &'a str,
    pub private_key: &'a str,
    pub address: Ipv4Addr,
    pub dns: &'a [String],
    pub server_public_key: &'a str,
    pub endpoint_host: &'a str,
    pub endpoint_port: u16,
}

impl ClientConfig<'_> {
    fn write(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "# {}", self.name)?;
        writeln!(out, "[Interface]")?;
        writeln!(out, "PrivateKey = {}", self.private_key)?;
        writeln!(out, "Address = {}/32", self.address)?;
        if !self.dns.is_empty() {
            writeln!(out, "DNS = {}", self.dns.join(", "))?;
        }
        writeln!(out)?;
        writeln!(out, "[Peer]")?;
        writeln!(out, "PublicKey = {}", self.server_public_key)?;
        writeln!(out, "Endpoint = {}:{}", self.endpoint_host, self.endpoint_port)?;
        writeln!(out, "AllowedIPs = 0.0.0.0/0")?;
        writeln!(out, "PersistentKeepalive = {PERSISTENT_KEEPALIVE}")
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.write(&mut out);
        out
    }
}

/// Render `payload` as an SVG QR code.
pub fn qr_svg(payload: &str) -> Result<String, QrError> {
    let code = QrCode::new(payload.as_bytes())?;
    Ok(code
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .quiet_zone(true)
        .build())
}

/// Render `payload` as a `data:` URL embedding the SVG QR code.
pub fn qr_data_url(payload: &str) -> Result<String, QrError> {
    let svg = qr_svg(payload)?;
    Ok(format!("data:image/svg+xml;base64,{}", BASE64.encode(svg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dns: &[String]) -> String {
        ClientConfig {
            name: "phone",
            private_key: "cHJpdmF0ZQ==",
            address: Ipv4Addr::new(10, 0, 0, 5),
            dns,
            server_public_key: "c2VydmVy",
            endpoint_host: "vpn.example.com",
            endpoint_port: 51820,
        }
        .render()
    }

    #[test]
    fn renders_interface_and_peer() {
        let dns = vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()];
        let text = sample(&dns);
        let expected = "\
# phone
[Interface]
PrivateKey = cHJpdmF0ZQ==
Address = 10.0.0.5/32
DNS = 1.1.1.1, 8.8.8.8

[Peer]
PublicKey = c2VydmVy
Endpoint = vpn.example.com:51820
AllowedIPs = 0.0.0.0/0
PersistentKeepalive = 25
";
        assert_eq!(text, expected);
    }

    #[test]
    fn omits_dns_when_empty() {
        assert!(!sample(&[]).contains("DNS"));
    }

    #[test]
    fn qr_encodes_config() {
        let svg = qr_svg(&sample(&[])).unwrap();
        assert!(svg.starts_with("<?xml"));
        assert!(svg.contains("<svg"));

        let url = qr_data_url("ss://example").unwrap();
        assert!(url.starts_with("data:image/svg+xml;base64,"));
    }
}
