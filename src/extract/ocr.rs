//! Bib OCR through an external command.
//!
//! The command is run with an image path appended to its configured
//! arguments and must print one JSON object per line:
//!
//! ```text
//! {"text": "1234", "confidence": 0.93}
//! ```
//!
//! Blank lines are ignored. A non-zero exit status or an unparseable line
//! fails the photo.

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, ImageFormat};
use std::path::Path;
use std::process::{Command, Stdio};

use super::BibRead;
use crate::config::OcrConfig;

#[derive(Debug, Clone)]
pub struct CommandOcr {
    program: String,
    args: Vec<String>,
}

impl CommandOcr {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &OcrConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .filter(|c| !c.trim().is_empty())
            .map(|c| Self::new(c.clone(), config.args.clone()))
    }

    /// Read bibs from an image already in memory. The command gets it as a
    /// temporary PNG, removed once the command returns.
    pub fn read_image(&self, image: &DynamicImage) -> Result<Vec<BibRead>> {
        let mut file = tempfile::Builder::new()
            .prefix("bibfinder-ocr-")
            .suffix(".png")
            .tempfile()
            .context("Failed to create OCR input file")?;
        image
            .write_to(file.as_file_mut(), ImageFormat::Png)
            .context("Failed to write OCR input image")?;
        self.read(file.path())
    }

    pub fn read(&self, image_path: &Path) -> Result<Vec<BibRead>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run OCR command {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "OCR command exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        parse_reads(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_reads(stdout: &str) -> Result<Vec<BibRead>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<BibRead>(line)
                .with_context(|| format!("Invalid OCR output line: {}", line))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reads() {
        let out = "{\"text\": \"1234\", \"confidence\": 0.93}\n\n{\"text\":\"7\",\"confidence\":0.5}\n";
        let reads = parse_reads(out).unwrap();
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].text, "1234");
        assert!((reads[1].confidence - 0.5).abs() < f32::EPSILON);

        assert!(parse_reads("not json").is_err());
        assert!(parse_reads("").unwrap().is_empty());
    }

    #[test]
    fn test_blank_command_disables_ocr() {
        let config = OcrConfig {
            command: Some("  ".to_string()),
            ..OcrConfig::default()
        };
        assert!(CommandOcr::from_config(&config).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_output_is_parsed() {
        let ocr = CommandOcr::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo '{\"text\":\"42\",\"confidence\":0.9}'".to_string(),
            ],
        );
        // sh -c ignores the trailing path argument ($0)
        let reads = ocr.read(Path::new("photo.jpg")).unwrap();
        assert_eq!(reads, vec![BibRead { text: "42".to_string(), confidence: 0.9 }]);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_reads_the_prepared_image() {
        let dir = tempfile::tempdir().unwrap();
        let seen = dir.path().join("seen.png");
        let ocr = CommandOcr::new(
            "sh",
            vec![
                "-c".to_string(),
                format!("cp \"$0\" '{}'", seen.display()),
            ],
        );

        let prepared = DynamicImage::new_rgb8(40, 30);
        assert!(ocr.read_image(&prepared).unwrap().is_empty());

        let copy = image::open(&seen).unwrap();
        assert_eq!((copy.width(), copy.height()), (40, 30));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command_is_an_error() {
        let ocr = CommandOcr::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);
        assert!(ocr.read(Path::new("photo.jpg")).is_err());
    }
}
