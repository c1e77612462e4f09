use super::{nvenc_quality, nvenc_tuning, EncodeOptions, Preset, Transcoder};

pub struct H264Nvenc;

impl Transcoder for H264Nvenc {
    fn transcode(&self, options: &EncodeOptions, ff: &mut Vec<String>) {
        nvenc_quality(self, "h264_nvenc", "vbr_hq", options, ff);
        nvenc_tuning(ff);
    }

    fn get_preset(&self, preset: Preset) -> String {
        preset.as_str().to_string()
    }
}
