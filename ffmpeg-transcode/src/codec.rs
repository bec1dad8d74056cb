//! Codec implementation lookup and selection.
//!
//! A logical [`CodecId`] maps to a [`CodecFamily`] that lists the concrete
//! implementations able to handle it. The [`Negotiator`] resolves those lists
//! against a [`CodecBackend`] and picks one, keeping the software default
//! aside so the engines can fall back to it when the pick fails to open.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use ffmpeg_next::{Dictionary, Packet, codec, ffi, media};

use crate::hw::{CapabilityProbe, HwVendor};
use crate::track::{CodecId, Track};

/// A concrete implementation, by registered name or by codec id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Name(String),
    Id(codec::Id),
}

impl Candidate {
    pub fn name(name: &str) -> Self {
        Candidate::Name(name.to_string())
    }
}

impl Display for Candidate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Candidate::Name(name) => f.write_str(name),
            Candidate::Id(id) => write!(f, "{:?}", id),
        }
    }
}

/// A resolved implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub name: String,
    pub id: codec::Id,
}

/// Parameters applied to a codec context before it is opened.
#[derive(Debug, Clone)]
pub struct OpenParams {
    /// 0 lets the codec pick.
    pub thread_count: usize,
    pub medium: media::Type,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub sample_rate: u32,
}

impl OpenParams {
    pub fn from_track(track: &Track, thread_count: usize) -> Self {
        Self {
            thread_count,
            medium: track.codec().medium(),
            width: track.width(),
            height: track.height(),
            channels: track.channels(),
            sample_rate: track.sample_rate(),
        }
    }

    /// The `threads` codec option: `auto`, or the request capped to the core count.
    pub fn threads_option(&self) -> String {
        if self.thread_count == 0 {
            return "auto".to_string();
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.thread_count.min(cores).to_string()
    }
}

/// One opened decoding context.
pub trait DecodeSession: Send {
    fn name(&self) -> &str;
    /// True when input must be whole access units, i.e. fragmented
    /// chunks have to be merged before they reach [`DecodeSession::send_packet`].
    fn needs_merge(&self) -> bool;
    fn send_packet(&mut self, packet: &Packet) -> Result<(), ffmpeg_next::Error>;
    fn send_eof(&mut self) -> Result<(), ffmpeg_next::Error>;
    fn receive_frame(&mut self, frame: &mut ffmpeg_next::Frame) -> Result<(), ffmpeg_next::Error>;
}

pub trait CodecBackend: Send + Sync {
    fn find_decoder(&self, candidate: &Candidate) -> Option<CodecInfo>;
    fn find_encoder(&self, candidate: &Candidate) -> Option<CodecInfo>;
    fn open_decoder(
        &self,
        info: &CodecInfo,
        params: &OpenParams,
    ) -> anyhow::Result<Box<dyn DecodeSession>>;
}

/// Lookups and sessions served by the linked FFmpeg libraries.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    fn resolve(
        kind: &str,
        candidate: &Candidate,
        found: Option<ffmpeg_next::Codec>,
    ) -> Option<CodecInfo> {
        match found {
            Some(codec) => {
                log::debug!("found {} {} for {}", kind, codec.name(), candidate);
                Some(CodecInfo {
                    name: codec.name().to_string(),
                    id: codec.id(),
                })
            }
            None => {
                log::trace!("{} {} not available", kind, candidate);
                None
            }
        }
    }
}

impl CodecBackend for FfmpegBackend {
    fn find_decoder(&self, candidate: &Candidate) -> Option<CodecInfo> {
        let found = match candidate {
            Candidate::Name(name) => ffmpeg_next::decoder::find_by_name(name),
            Candidate::Id(id) => ffmpeg_next::decoder::find(*id),
        };
        Self::resolve("decoder", candidate, found)
    }

    fn find_encoder(&self, candidate: &Candidate) -> Option<CodecInfo> {
        let found = match candidate {
            Candidate::Name(name) => ffmpeg_next::encoder::find_by_name(name),
            Candidate::Id(id) => ffmpeg_next::encoder::find(*id),
        };
        Self::resolve("encoder", candidate, found)
    }

    fn open_decoder(
        &self,
        info: &CodecInfo,
        params: &OpenParams,
    ) -> anyhow::Result<Box<dyn DecodeSession>> {
        let implementation = ffmpeg_next::decoder::find_by_name(&info.name)
            .ok_or_else(|| anyhow::anyhow!("decoder {} not found", info.name))?;
        let mut ctx = codec::Context::new_with_codec(implementation);
        unsafe {
            let raw = ctx.as_mut_ptr();
            (*raw).flags |= ffi::AV_CODEC_FLAG_LOW_DELAY as i32;
            (*raw).flags2 |= ffi::AV_CODEC_FLAG2_FAST as i32;
            match params.medium {
                media::Type::Video => {
                    (*raw).width = params.width as i32;
                    (*raw).height = params.height as i32;
                    log::info!("media source: {} X {}", params.width, params.height);
                }
                media::Type::Audio if params.channels > 0 => {
                    ffi::av_channel_layout_default(&mut (*raw).ch_layout, params.channels as i32);
                    (*raw).sample_rate = params.sample_rate as i32;
                }
                _ => {}
            }
        }

        let mut opts = Dictionary::new();
        opts.set("threads", &params.threads_option());
        opts.set("zerolatency", "1");
        opts.set("strict", "-2");

        let decoder = ctx
            .decoder()
            .open_as_with(implementation, opts)?;
        log::info!("decoder opened: {}", info.name);

        Ok(Box::new(FfmpegSession {
            name: info.name.clone(),
            decoder,
        }))
    }
}

struct FfmpegSession {
    name: String,
    decoder: codec::decoder::Opened,
}

impl DecodeSession for FfmpegSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_merge(&self) -> bool {
        // libavcodec dropped AV_CODEC_CAP_TRUNCATED, every decoder takes
        // whatever the caller has assembled
        false
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), ffmpeg_next::Error> {
        self.decoder.send_packet(packet)
    }

    fn send_eof(&mut self) -> Result<(), ffmpeg_next::Error> {
        self.decoder.send_eof()
    }

    fn receive_frame(&mut self, frame: &mut ffmpeg_next::Frame) -> Result<(), ffmpeg_next::Error> {
        self.decoder.receive_frame(frame)
    }
}

/// Per-codec candidate lists. Lists are in ascending priority: the last
/// resolvable entry wins.
pub trait CodecFamily: Send + Sync {
    fn codec(&self) -> CodecId;

    fn decoders(&self, probe: &CapabilityProbe) -> Vec<Candidate>;

    fn default_decoder(&self) -> Candidate {
        Candidate::Id(self.codec().av_id())
    }

    fn encoders(&self, probe: &CapabilityProbe) -> Vec<Candidate>;

    fn default_encoder(&self) -> Candidate {
        Candidate::Id(self.codec().av_id())
    }

    /// Last chance to adjust open parameters taken from the track.
    fn configure(&self, _params: &mut OpenParams) {}
}

/// Entry of a static candidate table.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Named(&'static str),
    /// Whatever implementation the library registers for the codec id.
    Native,
}

/// Video codecs that have vendor hardware implementations.
struct AcceleratedFamily {
    codec: CodecId,
    decoders: &'static [Slot],
    hw_decoders: [&'static str; 3],
    encoders: &'static [Slot],
    hw_encoders: [&'static str; 3],
}

impl AcceleratedFamily {
    fn build(&self, software: &[Slot], hardware: &[&str; 3], probe: &CapabilityProbe) -> Vec<Candidate> {
        let mut list: Vec<Candidate> = software
            .iter()
            .map(|slot| match slot {
                Slot::Named(name) => Candidate::name(name),
                Slot::Native => Candidate::Id(self.codec.av_id()),
            })
            .collect();
        for (vendor, name) in HwVendor::ALL.iter().zip(hardware.iter()) {
            if probe.supports(*vendor) {
                list.push(Candidate::name(name));
            }
        }
        list
    }
}

impl CodecFamily for AcceleratedFamily {
    fn codec(&self) -> CodecId {
        self.codec
    }

    fn decoders(&self, probe: &CapabilityProbe) -> Vec<Candidate> {
        self.build(self.decoders, &self.hw_decoders, probe)
    }

    fn encoders(&self, probe: &CapabilityProbe) -> Vec<Candidate> {
        self.build(self.encoders, &self.hw_encoders, probe)
    }
}

/// Codecs served by software implementations only.
struct SoftwareFamily {
    codec: CodecId,
    encoders: &'static [&'static str],
    /// Mono 8 kHz when the track leaves the audio layout out.
    telephony: bool,
}

impl CodecFamily for SoftwareFamily {
    fn codec(&self) -> CodecId {
        self.codec
    }

    fn decoders(&self, _probe: &CapabilityProbe) -> Vec<Candidate> {
        vec![Candidate::Id(self.codec.av_id())]
    }

    fn encoders(&self, _probe: &CapabilityProbe) -> Vec<Candidate> {
        let mut list = vec![Candidate::Id(self.codec.av_id())];
        list.extend(self.encoders.iter().map(|name| Candidate::name(name)));
        list
    }

    fn configure(&self, params: &mut OpenParams) {
        if !self.telephony {
            return;
        }
        if params.channels == 0 {
            params.channels = 1;
        }
        if params.sample_rate == 0 {
            params.sample_rate = 8000;
        }
    }
}

pub struct CodecRegistry {
    families: HashMap<CodecId, Box<dyn CodecFamily>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(AcceleratedFamily {
            codec: CodecId::H264,
            decoders: &[
                Slot::Named("libopenh264"),
                Slot::Native,
                Slot::Named("h264_videotoolbox"),
                Slot::Named("h264_nvmpi"),
            ],
            hw_decoders: ["h264_cuvid", "h264_qsv", "h264_amf"],
            encoders: &[
                Slot::Named("libopenh264"),
                Slot::Named("libx264"),
                Slot::Named("h264_videotoolbox"),
            ],
            hw_encoders: ["h264_nvenc", "h264_qsv", "h264_amf"],
        });
        registry.register(AcceleratedFamily {
            codec: CodecId::H265,
            decoders: &[
                Slot::Native,
                Slot::Named("hevc_videotoolbox"),
                Slot::Named("hevc_nvmpi"),
            ],
            hw_decoders: ["hevc_cuvid", "hevc_qsv", "hevc_amf"],
            encoders: &[Slot::Named("libx265"), Slot::Named("hevc_videotoolbox")],
            hw_encoders: ["hevc_nvenc", "hevc_qsv", "hevc_amf"],
        });
        for (codec, encoders, telephony) in [
            (CodecId::Aac, &[][..], false),
            (CodecId::G711A, &[][..], true),
            (CodecId::G711U, &[][..], true),
            (CodecId::Opus, &["libopus"][..], false),
            (CodecId::Jpeg, &[][..], false),
            (CodecId::Vp8, &["libvpx"][..], false),
            (CodecId::Vp9, &["libvpx-vp9"][..], false),
        ] {
            registry.register(SoftwareFamily {
                codec,
                encoders,
                telephony,
            });
        }
        registry
    }
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            families: HashMap::new(),
        }
    }

    /// Adds or replaces the family for its codec.
    pub fn register(&mut self, family: impl CodecFamily + 'static) {
        self.families.insert(family.codec(), Box::new(family));
    }

    pub fn family(&self, codec: CodecId) -> anyhow::Result<&dyn CodecFamily> {
        self.families
            .get(&codec)
            .map(|family| family.as_ref())
            .ok_or_else(|| anyhow::anyhow!("unsupported codec {}", codec))
    }
}

/// Outcome of negotiation. `default` is kept for the open-failure retry and
/// may equal `chosen`.
#[derive(Debug, Clone)]
pub struct Selection {
    pub chosen: CodecInfo,
    pub default: Option<CodecInfo>,
}

pub struct Negotiator {
    registry: CodecRegistry,
    probe: Arc<CapabilityProbe>,
    backend: Arc<dyn CodecBackend>,
}

impl Negotiator {
    pub fn new(probe: Arc<CapabilityProbe>, backend: Arc<dyn CodecBackend>) -> Self {
        Self::with_registry(CodecRegistry::default(), probe, backend)
    }

    pub fn with_registry(
        registry: CodecRegistry,
        probe: Arc<CapabilityProbe>,
        backend: Arc<dyn CodecBackend>,
    ) -> Self {
        Self {
            registry,
            probe,
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CodecBackend> {
        &self.backend
    }

    pub fn probe(&self) -> &CapabilityProbe {
        &self.probe
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn select_decoder(&self, codec: CodecId, preferred: &[String]) -> anyhow::Result<Selection> {
        let family = self.registry.family(codec)?;
        select(
            "decoder",
            codec,
            preferred,
            family.decoders(&self.probe),
            family.default_decoder(),
            |candidate| self.backend.find_decoder(candidate),
        )
    }

    pub fn select_encoder(&self, codec: CodecId, preferred: &[String]) -> anyhow::Result<Selection> {
        let family = self.registry.family(codec)?;
        select(
            "encoder",
            codec,
            preferred,
            family.encoders(&self.probe),
            family.default_encoder(),
            |candidate| self.backend.find_encoder(candidate),
        )
    }
}

fn select(
    kind: &str,
    codec: CodecId,
    preferred: &[String],
    candidates: Vec<Candidate>,
    default: Candidate,
    find: impl Fn(&Candidate) -> Option<CodecInfo>,
) -> anyhow::Result<Selection> {
    let default = find(&default);

    // a preferred implementation only counts if it really is this codec
    let wanted = preferred
        .iter()
        .find_map(|name| find(&Candidate::Name(name.clone())))
        .filter(|info| info.id == codec.av_id());

    let chosen = wanted
        .or_else(|| candidates.iter().rev().find_map(|candidate| find(candidate)))
        .or_else(|| default.clone())
        .ok_or_else(|| anyhow::anyhow!("no {} found for {}", kind, codec))?;

    log::info!("selected {} {} for {}", kind, chosen.name, codec);
    Ok(Selection { chosen, default })
}
