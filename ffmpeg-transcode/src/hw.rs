//! Hardware acceleration discovery.
//!
//! A backend counts as usable when its runtime driver library loads and a
//! matching device node exists. Each answer is computed at most once per
//! [`CapabilityProbe`] and then reused; build one probe at pipeline start and
//! share it.

use std::path::PathBuf;
use std::sync::OnceLock;

use crate::config::TranscodeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwVendor {
    /// NVIDIA NVDEC/NVENC (cuvid).
    Nvidia,
    /// Intel Quick Sync.
    Qsv,
    /// AMD AMF.
    Amf,
}

impl HwVendor {
    pub const ALL: [HwVendor; 3] = [HwVendor::Nvidia, HwVendor::Qsv, HwVendor::Amf];

    fn index(self) -> usize {
        match self {
            HwVendor::Nvidia => 0,
            HwVendor::Qsv => 1,
            HwVendor::Amf => 2,
        }
    }
}

/// Where to look for one backend's driver library and device node.
#[derive(Debug, Clone)]
pub struct BackendProbe {
    pub library: String,
    pub device_dir: PathBuf,
    pub device_prefix: String,
}

impl BackendProbe {
    pub fn new(library: &str, device_dir: impl Into<PathBuf>, device_prefix: &str) -> Self {
        Self {
            library: library.to_string(),
            device_dir: device_dir.into(),
            device_prefix: device_prefix.to_string(),
        }
    }

    pub fn system(vendor: HwVendor) -> Self {
        match vendor {
            HwVendor::Nvidia => Self::new(NVIDIA_LIBRARY, "/dev", "nvidia"),
            HwVendor::Qsv => Self::new(QSV_LIBRARY, "/dev/dri", "renderD"),
            HwVendor::Amf => Self::new(AMF_LIBRARY, "/dev/dri", "renderD"),
        }
    }

    fn run(&self) -> bool {
        // SAFETY: only vendor driver libraries are loaded here and no symbol is
        // called; the handle is closed right away.
        match unsafe { libloading::Library::new(&self.library) } {
            Ok(lib) => drop(lib),
            Err(e) => {
                log::warn!("{} load failed: {}", self.library, e);
                return false;
            }
        }

        self.has_device()
    }

    #[cfg(unix)]
    fn has_device(&self) -> bool {
        let found = std::fs::read_dir(&self.device_dir)
            .map(|entries| {
                entries.filter_map(Result::ok).any(|entry| {
                    let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(true);
                    !is_dir
                        && entry
                            .file_name()
                            .to_string_lossy()
                            .starts_with(&self.device_prefix)
                })
            })
            .unwrap_or(false);
        if !found {
            log::warn!(
                "device node {}/{}* not found",
                self.device_dir.display(),
                self.device_prefix
            );
        }
        found
    }

    /// Adapters cannot be enumerated here, so a loadable driver alone does
    /// not count as a usable backend.
    #[cfg(not(unix))]
    fn has_device(&self) -> bool {
        log::warn!(
            "{} loaded but no adapter enumeration on this platform",
            self.library
        );
        false
    }
}

#[cfg(windows)]
const NVIDIA_LIBRARY: &str = "nvcuvid.dll";
#[cfg(not(windows))]
const NVIDIA_LIBRARY: &str = "libnvcuvid.so.1";
#[cfg(windows)]
const QSV_LIBRARY: &str = "libmfxhw64.dll";
#[cfg(not(windows))]
const QSV_LIBRARY: &str = "libmfx.so.1";
#[cfg(windows)]
const AMF_LIBRARY: &str = "amfrt64.dll";
#[cfg(not(windows))]
const AMF_LIBRARY: &str = "libamfrt64.so.1";

/// Point-in-time view of the three backend answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub nvidia: bool,
    pub qsv: bool,
    pub amf: bool,
}

pub struct CapabilityProbe {
    /// `None` means the probe is switched off.
    probes: [Option<BackendProbe>; 3],
    results: [OnceLock<bool>; 3],
}

impl CapabilityProbe {
    /// System probes, each gated by its `check_*` switch.
    pub fn new(config: &TranscodeConfig) -> Self {
        let enabled = |on: bool, vendor| on.then(|| BackendProbe::system(vendor));
        Self::with_backends(
            enabled(config.check_nvidia, HwVendor::Nvidia),
            enabled(config.check_qsv, HwVendor::Qsv),
            enabled(config.check_amf, HwVendor::Amf),
        )
    }

    pub fn with_backends(
        nvidia: Option<BackendProbe>,
        qsv: Option<BackendProbe>,
        amf: Option<BackendProbe>,
    ) -> Self {
        Self {
            probes: [nvidia, qsv, amf],
            results: Default::default(),
        }
    }

    /// A probe whose answers are already known.
    pub fn fixed(caps: Capabilities) -> Self {
        let probe = Self::with_backends(None, None, None);
        for (slot, value) in probe.results.iter().zip([caps.nvidia, caps.qsv, caps.amf]) {
            let _ = slot.set(value);
        }
        probe
    }

    /// Every backend reported unavailable, nothing is touched.
    pub fn disabled() -> Self {
        Self::with_backends(None, None, None)
    }

    pub fn supports(&self, vendor: HwVendor) -> bool {
        let index = vendor.index();
        *self.results[index].get_or_init(|| match &self.probes[index] {
            Some(probe) => {
                let usable = probe.run();
                log::info!("hardware backend {:?} usable: {}", vendor, usable);
                usable
            }
            None => false,
        })
    }

    pub fn nvidia(&self) -> bool {
        self.supports(HwVendor::Nvidia)
    }

    pub fn qsv(&self) -> bool {
        self.supports(HwVendor::Qsv)
    }

    pub fn amf(&self) -> bool {
        self.supports(HwVendor::Amf)
    }

    /// Probes every backend that has not been probed yet.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            nvidia: self.nvidia(),
            qsv: self.qsv(),
            amf: self.amf(),
        }
    }
}

/// Returns a pixel format suitable for the encoder. Source formats not supported (e.g. rgb24)
/// are mapped to YUV420P; hardware encoders prefer NV12.
pub fn pixel_format_for_encoder(
    source: ffmpeg_next::format::Pixel,
    codec_name: &str,
) -> ffmpeg_next::format::Pixel {
    use ffmpeg_next::format::Pixel;
    if codec_name == "mjpeg" {
        return Pixel::YUVJ420P;
    }
    let is_hw = is_hw_codec(codec_name);
    match source {
        Pixel::RGB24 | Pixel::BGR24 | Pixel::RGBA | Pixel::BGRA => {
            if is_hw {
                Pixel::NV12
            } else {
                Pixel::YUV420P
            }
        }
        Pixel::None => Pixel::YUV420P,
        _ => source,
    }
}

pub fn is_hw_codec(codec_name: &str) -> bool {
    ["cuvid", "nvenc", "qsv", "amf", "vaapi", "videotoolbox", "nvmpi", "v4l2m2m"]
        .iter()
        .any(|suffix| codec_name.contains(suffix))
}
