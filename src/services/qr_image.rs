//! QR image for a ticket code.
//!
//! The image comes from an external QR service. When that fails, a local
//! placeholder is rendered so a ticket never lacks an image. Either way the PNG
//! is stored inline as a `data:` URL.

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::time::Duration;
use tracing::warn;

use crate::config::IssuanceConfig;

pub const QR_SIZE: u32 = 512;
const PLACEHOLDER_GRID: u32 = 29;
const PLACEHOLDER_MARGIN: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("QR service not configured")]
    NotConfigured,
    #[error("QR service request failed: {0}")]
    Request(String),
    #[error("QR service returned HTTP {0}")]
    Status(u16),
    #[error("QR service returned an empty body")]
    Empty,
    #[error("failed to encode placeholder PNG: {0}")]
    Encode(String),
}

pub struct QrAssetService {
    http: Client,
    service_url: Option<String>,
    timeout: Duration,
}

impl QrAssetService {
    pub fn new(config: &IssuanceConfig) -> Result<Self, QrError> {
        let http = Client::builder()
            .timeout(config.qr_timeout)
            .build()
            .map_err(|e| QrError::Request(e.to_string()))?;

        Ok(Self {
            http,
            service_url: config.qr_service_url.clone(),
            timeout: config.qr_timeout,
        })
    }

    /// `GET <service>?size=512x512&data=<code>`, PNG bytes on HTTP 200.
    pub async fn fetch_png(&self, code: &str) -> Result<Vec<u8>, QrError> {
        let base = self.service_url.as_deref().ok_or(QrError::NotConfigured)?;
        let separator = if base.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}{}size={}x{}&data={}",
            base,
            separator,
            QR_SIZE,
            QR_SIZE,
            urlencoding::encode(code)
        );

        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| QrError::Request(e.to_string()))?;

        if response.status().as_u16() != 200 {
            return Err(QrError::Status(response.status().as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| QrError::Request(e.to_string()))?;
        if bytes.is_empty() {
            return Err(QrError::Empty);
        }

        Ok(bytes.to_vec())
    }

    /// Inline image reference for `code`, falling back to the placeholder.
    pub async fn qr_ref_for(&self, code: &str) -> Result<String, QrError> {
        let png = match self.fetch_png(code).await {
            Ok(png) => png,
            Err(e) => {
                warn!(error = %e, "QR service unavailable, rendering placeholder");
                placeholder_png(code)?
            }
        };

        Ok(png_data_url(&png))
    }
}

pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}

/// Deterministic 512x512 black-and-white grid derived from a hash of the code.
/// Not a scannable QR code.
pub fn placeholder_png(code: &str) -> Result<Vec<u8>, QrError> {
    let digest = hex::encode(Sha256::digest(code.as_bytes()));
    let nibbles: Vec<u32> = digest.chars().filter_map(|c| c.to_digit(16)).collect();
    let cell = (QR_SIZE - 2 * PLACEHOLDER_MARGIN) / PLACEHOLDER_GRID;

    let mut img = GrayImage::from_pixel(QR_SIZE, QR_SIZE, Luma([255u8]));
    for y in 0..PLACEHOLDER_GRID {
        for x in 0..PLACEHOLDER_GRID {
            let index = ((y * PLACEHOLDER_GRID + x) as usize) % nibbles.len();
            if nibbles[index] % 2 == 0 {
                continue;
            }

            let left = PLACEHOLDER_MARGIN + x * cell;
            let top = PLACEHOLDER_MARGIN + y * cell;
            for py in top..top + cell {
                for px in left..left + cell {
                    img.put_pixel(px, py, Luma([0u8]));
                }
            }
        }
    }

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| QrError::Encode(e.to_string()))?;

    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn placeholder_is_a_deterministic_png() {
        let first = placeholder_png("ABC-DEF-23").unwrap();
        let second = placeholder_png("ABC-DEF-23").unwrap();
        let other = placeholder_png("ZZZ-ZZZ-ZZ").unwrap();

        assert_eq!(&first[..8], &PNG_SIGNATURE);
        assert_eq!(first, second);
        assert_ne!(first, other);

        let decoded = image::load_from_memory(&first).unwrap();
        assert_eq!(decoded.width(), QR_SIZE);
        assert_eq!(decoded.height(), QR_SIZE);
    }

    #[test]
    fn data_url_prefix() {
        assert_eq!(png_data_url(b"abc"), "data:image/png;base64,YWJj");
    }

    #[tokio::test]
    async fn unconfigured_service_falls_back_to_placeholder() {
        let service = QrAssetService::new(&IssuanceConfig {
            qr_service_url: None,
            ..Default::default()
        })
        .unwrap();

        assert!(matches!(
            service.fetch_png("ABC-DEF-23").await,
            Err(QrError::NotConfigured)
        ));
        let qr_ref = service.qr_ref_for("ABC-DEF-23").await.unwrap();
        assert_eq!(
            qr_ref,
            png_data_url(&placeholder_png("ABC-DEF-23").unwrap())
        );
    }
}
