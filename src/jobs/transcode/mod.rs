mod av1;
mod avc;
mod hevc;
mod locate;
mod process;
mod progress;
mod proxy;
mod template;

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::EncodeError;
use av1::Av1Nvenc;
use avc::H264Nvenc;
use hevc::HevcNvenc;
use proxy::ProxyAv1;

// re-export from the submodules
pub use locate::EncoderLocator;
pub use process::*;
pub use progress::{parse_time, ProgressParser, ProgressSample};
pub use template::{render_template, tokenize, validate_template, INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER};

/// Highest constant-quality value the NVENC encoders accept.
pub const MAX_QUALITY: u8 = 51;

/// Target video codec. `ProxyOnly` produces a small editing proxy instead of a final encode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum Codec {
    #[default]
    #[serde(rename = "AV1")]
    Av1,
    #[serde(rename = "H265")]
    H265,
    #[serde(rename = "H264")]
    H264,
    #[serde(rename = "ProxyOnly")]
    ProxyOnly,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Av1 => "AV1",
            Self::H265 => "H265",
            Self::H264 => "H264",
            Self::ProxyOnly => "ProxyOnly",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "av1" => Ok(Self::Av1),
            "h265" | "hevc" => Ok(Self::H265),
            "h264" | "avc" => Ok(Self::H264),
            "proxyonly" | "proxy" | "crea proxy" => Ok(Self::ProxyOnly),
            _ => Err(EncodeError::configuration(format!("unrecognized codec '{}'", s))),
        }
    }
}

impl TryFrom<String> for Codec {
    type Error = EncodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// NVENC preset, ordered from fastest (`p1`) to slowest (`p7`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(try_from = "String")]
pub enum Preset {
    #[serde(rename = "p1")]
    P1,
    #[serde(rename = "p2")]
    P2,
    #[serde(rename = "p3")]
    P3,
    #[serde(rename = "p4")]
    P4,
    #[serde(rename = "p5")]
    P5,
    #[default]
    #[serde(rename = "p6")]
    P6,
    #[serde(rename = "p7")]
    P7,
}

impl Preset {
    pub const ALL: [Preset; 7] = [
        Self::P1,
        Self::P2,
        Self::P3,
        Self::P4,
        Self::P5,
        Self::P6,
        Self::P7,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P1 => "p1",
            Self::P2 => "p2",
            Self::P3 => "p3",
            Self::P4 => "p4",
            Self::P5 => "p5",
            Self::P6 => "p6",
            Self::P7 => "p7",
        }
    }
}

impl FromStr for Preset {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == token)
            .ok_or_else(|| EncodeError::configuration(format!("unrecognized preset '{}'", s)))
    }
}

impl TryFrom<String> for Preset {
    type Error = EncodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Output height for the AV1 GPU scaler.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum Scale {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "4k")]
    Uhd4k,
    #[serde(rename = "2k")]
    Qhd2k,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "576p")]
    P576,
    #[serde(rename = "480p")]
    P480,
}

impl Scale {
    /// Target height in pixels, `None` when the source resolution is kept.
    pub fn height(&self) -> Option<u32> {
        match self {
            Self::None => None,
            Self::Uhd4k => Some(2160),
            Self::Qhd2k => Some(1440),
            Self::P1080 => Some(1080),
            Self::P720 => Some(720),
            Self::P576 => Some(576),
            Self::P480 => Some(480),
        }
    }
}

impl FromStr for Scale {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "nessuno" => Ok(Self::None),
            "4k" | "2160p" => Ok(Self::Uhd4k),
            "2k" | "1440p" => Ok(Self::Qhd2k),
            "1080p" => Ok(Self::P1080),
            "720p" => Ok(Self::P720),
            "576p" => Ok(Self::P576),
            "480p" => Ok(Self::P480),
            _ => Err(EncodeError::configuration(format!("unrecognized scale '{}'", s))),
        }
    }
}

impl TryFrom<String> for Scale {
    type Error = EncodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// User-selected encode settings, read once per job when its command is synthesized.
///
/// `scale` only applies to AV1, and `ProxyOnly` ignores `preset`, `quality` and `scale`.
/// When `manual_template` is set it replaces argument assembly entirely.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EncodeOptions {
    pub codec: Codec,
    pub preset: Preset,
    /// Constant quality (0-51), 0 lets the encoder pick
    pub quality: u8,
    pub scale: Scale,
    pub manual_template: Option<String>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            codec: Codec::Av1,
            preset: Preset::P6,
            quality: 0,
            scale: Scale::None,
            manual_template: None,
        }
    }
}

/// Generate encoder arguments for one codec
pub trait Transcoder {
    /// Append the video encoder arguments that follow the input file.
    fn transcode(&self, options: &EncodeOptions, ff: &mut Vec<String>);
    fn get_preset(&self, preset: Preset) -> String;
}

pub(crate) fn push_args<const N: usize>(ff: &mut Vec<String>, args: [&str; N]) {
    ff.extend(args.iter().map(|a| a.to_string()));
}

/// Derive where the encode of `source` is written.
///
/// Proxies go to `<dir>/proxy/<file name>`, everything else to
/// `<dir>/<stem>_<codec>_CQ<quality><.ext>` next to the source, so running the same
/// options twice overwrites the previous result instead of piling up copies.
pub fn output_path(source: &Path, options: &EncodeOptions) -> Result<PathBuf, EncodeError> {
    let file_name = source.file_name().ok_or_else(|| {
        EncodeError::configuration(format!("'{}' does not name a file", source.display()))
    })?;
    let dir = source.parent().unwrap_or_else(|| Path::new(""));

    if options.codec == Codec::ProxyOnly {
        return Ok(dir.join("proxy").join(file_name));
    }

    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    Ok(dir.join(format!(
        "{}_{}_CQ{}{}",
        stem, options.codec, options.quality, ext
    )))
}

/// Build the full encoder argument vector (executable first) and the output path for one source file.
pub fn synthesize(
    source: &Path,
    options: &EncodeOptions,
    encoder: &Path,
) -> Result<(Vec<String>, PathBuf), EncodeError> {
    if encoder.as_os_str().is_empty() {
        return Err(EncodeError::configuration("encoder executable not found"));
    }
    if options.quality > MAX_QUALITY {
        return Err(EncodeError::configuration(format!(
            "quality {} is outside 0-{}",
            options.quality, MAX_QUALITY
        )));
    }

    let output = output_path(source, options)?;

    if let Some(manual) = options.manual_template.as_deref() {
        let argv = template::instantiate(manual, source, &output, encoder)?;
        return Ok((argv, output));
    }

    let transcoder: Box<dyn Transcoder> = match options.codec {
        Codec::Av1 => Box::new(Av1Nvenc),
        Codec::H265 => Box::new(HevcNvenc),
        Codec::H264 => Box::new(H264Nvenc),
        Codec::ProxyOnly => Box::new(ProxyAv1),
    };

    let mut ff = vec![encoder.to_string_lossy().into_owned()];
    // always overwrite, decode on the GPU
    push_args(
        &mut ff,
        ["-y", "-hwaccel", "cuda", "-hwaccel_output_format", "cuda", "-i"],
    );
    ff.push(source.to_string_lossy().into_owned());

    transcoder.transcode(options, &mut ff);

    // audio is passed through untouched
    push_args(&mut ff, ["-c:a", "copy"]);
    ff.push(output.to_string_lossy().into_owned());

    Ok((ff, output))
}

/// Rate control and tuning shared by the NVENC encoders.
pub(crate) fn nvenc_quality(
    transcoder: &dyn Transcoder,
    encoder: &str,
    rate_control: &str,
    options: &EncodeOptions,
    ff: &mut Vec<String>,
) {
    push_args(ff, ["-c:v", encoder, "-preset"]);
    ff.push(transcoder.get_preset(options.preset));
    push_args(ff, ["-rc", rate_control, "-b:v", "0", "-cq"]);
    ff.push(options.quality.to_string());
}

pub(crate) fn nvenc_tuning(ff: &mut Vec<String>) {
    push_args(
        ff,
        [
            "-tune",
            "hq",
            "-rc-lookahead",
            "64",
            "-spatial-aq",
            "1",
            "-temporal-aq",
            "1",
            // fixed GOP and b-frames
            "-g",
            "120",
            "-bf",
            "2",
            "-movflags",
            "+faststart",
        ],
    );
}
