use anyhow::{bail, Context, Result};
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::constants::{ICON_FETCH_TIMEOUT_SECS, ICON_SIZE};

/// A decoded icon, re-encoded as PNG for serving.
#[derive(Debug, Clone)]
pub struct IconImage {
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

/// Icons registered with the map, keyed by the reference towers use for them.
pub struct IconRegistry {
    client: reqwest::Client,
    icons: Mutex<HashMap<String, IconImage>>,
}

impl IconRegistry {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ICON_FETCH_TIMEOUT_SECS))
            .build()
            .context("Failed to build icon HTTP client")?;
        Ok(Self {
            client,
            icons: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.icons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(reference)
    }

    pub fn get(&self, reference: &str) -> Option<IconImage> {
        self.icons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
    }

    pub fn add_image(&self, reference: &str, icon: IconImage) {
        self.icons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.to_string(), icon);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.icons.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Fetches (http/https) or reads (local path) an icon and decodes it.
    pub async fn load_image(&self, reference: &str) -> Result<IconImage> {
        let bytes = if reference.starts_with("http://") || reference.starts_with("https://") {
            let response = self
                .client
                .get(reference)
                .send()
                .await
                .with_context(|| format!("Failed to fetch icon {}", reference))?;
            if !response.status().is_success() {
                bail!("Icon {} returned HTTP {}", reference, response.status());
            }
            response
                .bytes()
                .await
                .with_context(|| format!("Failed to read icon body {}", reference))?
                .to_vec()
        } else {
            tokio::fs::read(reference)
                .await
                .with_context(|| format!("Failed to read icon file {}", reference))?
        };

        decode_icon(&bytes).with_context(|| format!("Failed to decode icon {}", reference))
    }

    /// Loads and registers every reference not yet registered. A failed icon is
    /// skipped and reported; it never stops the others.
    pub async fn load_missing<I>(&self, references: I) -> Vec<(String, anyhow::Error)>
    where
        I: IntoIterator<Item = String>,
    {
        let mut failures = Vec::new();
        for reference in references {
            if reference.is_empty() || self.has_image(&reference) {
                continue;
            }
            match self.load_image(&reference).await {
                Ok(icon) => {
                    tracing::info!("🖼️  Registered icon {} ({}x{})", reference, icon.width, icon.height);
                    self.add_image(&reference, icon);
                }
                Err(e) => {
                    tracing::error!("❌ Icon registration failed: {:#}", e);
                    failures.push((reference, e));
                }
            }
        }
        failures
    }
}

/// Decodes an image and shrinks it to fit the icon box, preserving aspect ratio.
pub fn decode_icon(bytes: &[u8]) -> Result<IconImage> {
    let img = image::load_from_memory(bytes)?;
    let img: DynamicImage = if img.width() > ICON_SIZE || img.height() > ICON_SIZE {
        img.resize(ICON_SIZE, ICON_SIZE, image::imageops::FilterType::Triangle)
    } else {
        img
    };
    let (width, height) = img.dimensions();

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("Failed to encode icon as PNG")?;

    Ok(IconImage { width, height, png })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("towermap-icons-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_png(path: &PathBuf, width: u32, height: u32) {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([255, 0, 0, 255]));
        img.save(path).unwrap();
    }

    #[test]
    fn large_icons_are_scaled_into_the_box() {
        let img = image::RgbaImage::from_pixel(256, 128, image::Rgba([0, 0, 255, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let icon = decode_icon(&bytes).unwrap();
        assert_eq!((icon.width, icon.height), (64, 32));
        assert!(image::load_from_memory(&icon.png).is_ok());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_icon(b"definitely not an image").is_err());
    }

    #[tokio::test]
    async fn failed_icon_does_not_block_others() {
        let dir = scratch_dir();
        let good = dir.join("pin.png");
        write_png(&good, 16, 16);
        let broken = dir.join("broken.png");
        std::fs::write(&broken, b"nope").unwrap();
        let missing = dir.join("missing.png");

        let registry = IconRegistry::new().unwrap();
        let refs = vec![
            broken.to_string_lossy().to_string(),
            good.to_string_lossy().to_string(),
            missing.to_string_lossy().to_string(),
        ];
        let failures = registry.load_missing(refs).await;

        assert_eq!(failures.len(), 2);
        assert!(registry.has_image(&good.to_string_lossy()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&good.to_string_lossy()).unwrap().width, 16);
    }

    #[tokio::test]
    async fn registered_icons_are_not_reloaded() {
        let dir = scratch_dir();
        let path = dir.join("pin.png");
        write_png(&path, 8, 8);
        let reference = path.to_string_lossy().to_string();

        let registry = IconRegistry::new().unwrap();
        assert!(registry.load_missing(vec![reference.clone()]).await.is_empty());

        // Remove the file: a second pass must not try to read it again
        std::fs::remove_file(&path).unwrap();
        assert!(registry.load_missing(vec![reference.clone()]).await.is_empty());
        assert!(registry.has_image(&reference));
    }
}
