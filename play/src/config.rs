use std::env;
use std::str::FromStr;

use filters::color::ColorOverride;
use filters::{Codec, ScaleTarget};
use stream::Error;

/// Default stream buffer budget, compressed and uncompressed.
pub const DEFAULT_BUFFER_SIZE: usize = 10 * 1024 * 1024;
/// Default audio silence threshold in microseconds.
pub const DEFAULT_SILENCE_THRESHOLD: u64 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Play,
    Info,
    ExportWav,
    ExportYuv4mpeg,
    ExportImg,
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Action, Error> {
        Ok(match s {
            "play" => Action::Play,
            "info" => Action::Info,
            "wav" => Action::ExportWav,
            "yuv4mpeg" => Action::ExportYuv4mpeg,
            "img" => Action::ExportImg,
            _ => return Err(Error::Inval),
        })
    }
}

/// A hotkey descriptor of the form `<Shift><Ctrl>KEYNAME`, consumed by
/// the external dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hotkey {
    pub shift: bool,
    pub ctrl: bool,
    pub key: String,
}

impl FromStr for Hotkey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Hotkey, Error> {
        let mut shift = false;
        let mut ctrl = false;
        let mut rest = s.trim();
        loop {
            if let Some(r) = rest.strip_prefix("<Shift>") {
                shift = true;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("<Ctrl>") {
                ctrl = true;
                rest = r;
            } else {
                break;
            }
        }
        if rest.is_empty() || rest.contains('<') {
            return Err(Error::Inval);
        }
        Ok(Hotkey { shift, ctrl, key: rest.to_string() })
    }
}

pub fn parse_scale(s: &str) -> Result<ScaleTarget, Error> {
    if let Some((w, h)) = s.split_once('x') {
        let w: u32 = w.parse().map_err(|_| Error::Inval)?;
        let h: u32 = h.parse().map_err(|_| Error::Inval)?;
        if w == 0 || h == 0 {
            return Err(Error::Inval);
        }
        Ok(ScaleTarget::Size(w, h))
    } else {
        let f: f64 = s.parse().map_err(|_| Error::Inval)?;
        if f <= 0.0 {
            return Err(Error::Inval);
        }
        Ok(ScaleTarget::Factor(f))
    }
}

/// `brightness;contrast;red;green;blue`.
pub fn parse_color(s: &str) -> Result<ColorOverride, Error> {
    let parts: Vec<f32> = s
        .split(';')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|_| Error::Inval)?;
    let &[brightness, contrast, red, green, blue] = parts.as_slice() else {
        return Err(Error::Inval);
    };
    Ok(ColorOverride { brightness, contrast, red, green, blue })
}

pub fn parse_codec(s: &str) -> Result<Option<Codec>, Error> {
    Ok(match s {
        "lz4" => Some(Codec::Lz4),
        "zstd" => Some(Codec::Zstd),
        "deflate" => Some(Codec::Deflate),
        "none" => None,
        _ => return Err(Error::Inval),
    })
}

/// Process-level knobs, all read from `REEL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub action: Action,
    pub hotkey: Hotkey,
    pub reload_hotkey: Hotkey,
    pub audio_device: String,
    pub silence_threshold: u64,
    pub scale: ScaleTarget,
    pub color: Option<ColorOverride>,
    pub codec: Option<Codec>,
    pub compress_min: usize,
    pub compressed_size: usize,
    pub uncompressed_size: usize,
    pub info_level: u32,
    pub verbosity: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            action: Action::Play,
            hotkey: Hotkey { shift: true, ctrl: false, key: "F8".into() },
            reload_hotkey: Hotkey { shift: true, ctrl: false, key: "F9".into() },
            audio_device: "default".into(),
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            scale: ScaleTarget::Factor(1.0),
            color: None,
            codec: Some(Codec::Lz4),
            compress_min: filters::DEFAULT_COMPRESS_MIN,
            compressed_size: DEFAULT_BUFFER_SIZE,
            uncompressed_size: DEFAULT_BUFFER_SIZE,
            info_level: 1,
            verbosity: 0,
        }
    }
}

fn knob<T>(cfg: &mut T, name: &str, parse: impl Fn(&str) -> Result<T, Error>) {
    if let Ok(value) = env::var(name) {
        match parse(&value) {
            Ok(v) => *cfg = v,
            Err(_) => log::warn!("config: invalid {name}=\"{value}\", using default"),
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let mut cfg = Config::default();
        knob(&mut cfg.action, "REEL_ACTION", Action::from_str);
        knob(&mut cfg.hotkey, "REEL_HOTKEY", Hotkey::from_str);
        knob(&mut cfg.reload_hotkey, "REEL_RELOAD_HOTKEY", Hotkey::from_str);
        knob(&mut cfg.audio_device, "REEL_AUDIO_DEVICE", |s| Ok(s.to_string()));
        knob(&mut cfg.silence_threshold, "REEL_SILENCE", |s| {
            let secs: f64 = s.parse().map_err(|_| Error::Inval)?;
            if secs < 0.0 {
                return Err(Error::Inval);
            }
            Ok((secs * 1_000_000.0) as u64)
        });
        knob(&mut cfg.scale, "REEL_SCALE", parse_scale);
        knob(&mut cfg.color, "REEL_COLOR", |s| parse_color(s).map(Some));
        knob(&mut cfg.codec, "REEL_CODEC", parse_codec);
        knob(&mut cfg.compress_min, "REEL_COMPRESS_MIN", |s| {
            s.parse().map_err(|_| Error::Inval)
        });
        knob(&mut cfg.compressed_size, "REEL_COMPRESSED_SIZE", |s| {
            let mib: usize = s.parse().map_err(|_| Error::Inval)?;
            if mib == 0 {
                return Err(Error::Inval);
            }
            Ok(mib * 1024 * 1024)
        });
        knob(&mut cfg.uncompressed_size, "REEL_UNCOMPRESSED_SIZE", |s| {
            let mib: usize = s.parse().map_err(|_| Error::Inval)?;
            if mib == 0 {
                return Err(Error::Inval);
            }
            Ok(mib * 1024 * 1024)
        });
        knob(&mut cfg.info_level, "REEL_INFO_LEVEL", |s| {
            s.parse().map_err(|_| Error::Inval)
        });
        knob(&mut cfg.verbosity, "REEL_VERBOSITY", |s| {
            s.parse().map_err(|_| Error::Inval)
        });
        cfg
    }
}
