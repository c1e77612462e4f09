use super::{push_args, EncodeOptions, Preset, Transcoder};

/// Height of generated proxies.
const PROXY_HEIGHT: u32 = 576;

/// Fast low-latency AV1 proxy. User quality, preset and scale are ignored.
pub struct ProxyAv1;

impl Transcoder for ProxyAv1 {
    fn transcode(&self, _options: &EncodeOptions, ff: &mut Vec<String>) {
        push_args(ff, ["-c:v", "av1_nvenc", "-vf"]);
        ff.push(format!("scale_cuda=-2:{}", PROXY_HEIGHT));
        push_args(ff, ["-preset"]);
        ff.push(self.get_preset(Preset::P1));
        push_args(ff, ["-cq", "0", "-tune", "ll", "-g", "30"]);
    }

    fn get_preset(&self, _preset: Preset) -> String {
        // always the fastest preset
        Preset::P1.as_str().to_string()
    }
}
