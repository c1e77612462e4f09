use super::{nvenc_quality, nvenc_tuning, push_args, EncodeOptions, Preset, Transcoder};

pub struct Av1Nvenc;

impl Transcoder for Av1Nvenc {
    fn transcode(&self, options: &EncodeOptions, ff: &mut Vec<String>) {
        nvenc_quality(self, "av1_nvenc", "vbr", options, ff);

        // only the AV1 path resizes, on the GPU
        if let Some(height) = options.scale.height() {
            push_args(ff, ["-vf"]);
            ff.push(format!("scale_cuda=-2:{}", height));
        }

        nvenc_tuning(ff);
    }

    fn get_preset(&self, preset: Preset) -> String {
        preset.as_str().to_string()
    }
}
