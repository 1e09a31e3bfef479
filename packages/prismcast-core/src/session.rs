//! Per-client session state and the dispatch logic that feeds media
//! chunks to the connection's send buffer.
//!
//! A session lives inside its connection task and is never shared, so all
//! mutation is single-threaded. Channel binding happens on `client-init`;
//! the start point may be deferred until the channel's ready frontier has
//! enough history behind it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::abr::{
    create_abr, select_audio_format, Abr, AbrError, AbrOptions, AckedChunk, SessionView,
};
use crate::channel::{Channel, ChannelRegistry};
use crate::constants::{MAX_VIDEO_IN_FLIGHT_CHUNKS, MEDIA_FRAME_MAX_BYTES};
use crate::media::{AudioFormat, MediaSegment, VideoFormat};
use crate::net::TcpInfo;
use crate::protocol::{
    pack, ClientEvent, ClientMessage, ProtocolError, ServerErrorKind, ServerMessage,
};
use crate::ws::{Frame, WsConnection};

/// Why a session must be failed. `error_kind` decides whether the client
/// gets a `server-error` before the close.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),

    #[error("resume point {0} is no longer available")]
    ResumeEvicted(u64),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("abr failure: {0}")]
    Abr(#[from] AbrError),
}

impl SessionError {
    /// The error kind to report to the client, when any.
    pub fn error_kind(&self) -> Option<ServerErrorKind> {
        match self {
            // malformed input gets a bare close
            Self::Protocol(_) => None,
            Self::UnknownChannel(_) | Self::ResumeEvicted(_) | Self::Abr(_) => {
                Some(ServerErrorKind::Reinit)
            }
        }
    }
}

/// Streaming positions and client-reported playback state, live once
/// `server-init` has been sent.
struct Stream {
    next_vts: u64,
    next_ats: u64,
    client_next_vts: u64,
    client_next_ats: u64,

    curr_vformat: Option<VideoFormat>,
    curr_aformat: Option<AudioFormat>,

    video_playback_buf: f64,
    audio_playback_buf: f64,
    cum_rebuffer: f64,
    startup_delay_s: Option<f64>,

    last_video_send: Option<Instant>,
    last_audio_send: Option<Instant>,

    /// Formats whose init segment has already been shipped on this
    /// connection.
    init_sent_vformats: HashSet<VideoFormat>,
    init_sent_aformats: HashSet<AudioFormat>,

    last_tcp_info: Option<TcpInfo>,
}

impl Stream {
    fn new(vts: u64, ats: u64) -> Self {
        Self {
            next_vts: vts,
            next_ats: ats,
            client_next_vts: vts,
            client_next_ats: ats,
            curr_vformat: None,
            curr_aformat: None,
            video_playback_buf: 0.0,
            audio_playback_buf: 0.0,
            cum_rebuffer: 0.0,
            startup_delay_s: None,
            last_video_send: None,
            last_audio_send: None,
            init_sent_vformats: HashSet::new(),
            init_sent_aformats: HashSet::new(),
            last_tcp_info: None,
        }
    }

    /// Chunks sent but not yet acked as about to play.
    fn video_in_flight_chunks(&self, vduration: u64) -> u64 {
        self.next_vts.saturating_sub(self.client_next_vts) / vduration
    }
}

/// A client's binding to one channel, created by `client-init`.
struct Binding {
    channel: Arc<Channel>,
    init_id: u32,
    abr: Box<dyn Abr>,
    /// Client-requested resume point, pending validation at start.
    resume_vts: Option<u64>,
    resume_ats: Option<u64>,
    /// None while the start point is deferred on the ready frontier.
    stream: Option<Stream>,
}

pub struct Session {
    connection_id: u64,
    abr_name: String,
    abr_options: AbrOptions,
    max_buffer_s: f64,
    created_at: Instant,
    pub last_msg_recv: Instant,

    screen_width: u16,
    screen_height: u16,

    binding: Option<Binding>,
}

impl Session {
    pub fn new(
        connection_id: u64,
        abr_name: String,
        abr_options: AbrOptions,
        max_buffer_s: f64,
    ) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            abr_name,
            abr_options,
            max_buffer_s,
            created_at: now,
            last_msg_recv: now,
            screen_width: 0,
            screen_height: 0,
            binding: None,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// The init id of the active binding, for `server-error` reporting.
    pub fn init_id(&self) -> u32 {
        self.binding.as_ref().map_or(0, |b| b.init_id)
    }

    // ── inbound ─────────────────────────────────────────────────────────

    pub fn handle_message(
        &mut self,
        msg: ClientMessage,
        registry: &ChannelRegistry,
        conn: &mut WsConnection,
    ) -> Result<(), SessionError> {
        self.last_msg_recv = Instant::now();

        match msg {
            ClientMessage::Init {
                init_id,
                channel,
                user_name,
                os,
                browser,
                screen_width,
                screen_height,
                next_vts,
                next_ats,
                ..
            } => {
                let channel = registry
                    .get(&channel)
                    .ok_or(SessionError::UnknownChannel(channel))?;

                log::info!(
                    "[conn {}] init {}: channel={} user={:?} {}/{} {}x{}",
                    self.connection_id,
                    init_id,
                    channel.name(),
                    user_name,
                    os,
                    browser,
                    screen_width,
                    screen_height
                );

                self.screen_width = screen_width;
                self.screen_height = screen_height;

                let abr = create_abr(&self.abr_name, &self.abr_options)?;
                self.binding = Some(Binding {
                    channel: Arc::clone(channel),
                    init_id,
                    abr,
                    resume_vts: next_vts,
                    resume_ats: next_ats,
                    stream: None,
                });

                self.try_start(conn)
            }

            ClientMessage::Info {
                init_id,
                event,
                video_buffer,
                audio_buffer,
                cum_rebuffer,
                screen_width,
                screen_height,
            } => {
                if let Some(w) = screen_width {
                    self.screen_width = w;
                }
                if let Some(h) = screen_height {
                    self.screen_height = h;
                }

                let startup_delay = self.created_at.elapsed().as_secs_f64();
                let Some(stream) = self.active_stream(init_id) else {
                    return Ok(());
                };

                stream.video_playback_buf = video_buffer;
                stream.audio_playback_buf = audio_buffer;
                stream.cum_rebuffer = cum_rebuffer;

                match event {
                    ClientEvent::Startup => {
                        stream.startup_delay_s.get_or_insert(startup_delay);
                    }
                    ClientEvent::Timer | ClientEvent::Rebuffer | ClientEvent::Play => {}
                }
                Ok(())
            }

            ClientMessage::VideoAck { ack, ssim } => {
                let Some(binding) = self.binding.as_mut() else {
                    return Ok(());
                };
                if binding.init_id != ack.init_id {
                    return Ok(());
                }
                let vduration = u64::from(binding.channel.read().vduration());
                let Some(stream) = binding.stream.as_mut() else {
                    return Ok(());
                };

                stream.video_playback_buf = ack.video_buffer;
                stream.audio_playback_buf = ack.audio_buffer;
                stream.cum_rebuffer = ack.cum_rebuffer;

                if ack.is_final_piece() {
                    stream.client_next_vts = ack.timestamp + vduration;

                    let format = ack.format.parse::<VideoFormat>();
                    if let (Some(sent_at), Ok(format)) = (stream.last_video_send, format) {
                        let chunk = AckedChunk {
                            format,
                            ssim,
                            size: ack.total_byte_length as usize,
                            trans_time_ms: sent_at.elapsed().as_millis() as u64,
                            tcp_info: stream.last_tcp_info,
                        };
                        binding.abr.video_chunk_acked(&chunk);
                    }
                }
                Ok(())
            }

            ClientMessage::AudioAck { ack } => {
                let Some(binding) = self.binding.as_mut() else {
                    return Ok(());
                };
                if binding.init_id != ack.init_id {
                    return Ok(());
                }
                let aduration = u64::from(binding.channel.read().aduration());
                let Some(stream) = binding.stream.as_mut() else {
                    return Ok(());
                };

                stream.video_playback_buf = ack.video_buffer;
                stream.audio_playback_buf = ack.audio_buffer;
                stream.cum_rebuffer = ack.cum_rebuffer;

                if ack.is_final_piece() {
                    stream.client_next_ats = ack.timestamp + aduration;
                }
                Ok(())
            }
        }
    }

    fn active_stream(&mut self, init_id: u32) -> Option<&mut Stream> {
        let binding = self.binding.as_mut()?;
        if binding.init_id != init_id {
            return None;
        }
        binding.stream.as_mut()
    }

    // ── dispatch ────────────────────────────────────────────────────────

    /// One dispatch tick: resolve a deferred start, then offer the session
    /// its next video and audio chunks. `tcp_info` is this tick's
    /// transport sample for the connection.
    pub fn dispatch(
        &mut self,
        conn: &mut WsConnection,
        send_high_watermark: usize,
        tcp_info: Option<TcpInfo>,
    ) -> Result<(), SessionError> {
        if self.binding.is_none() {
            return Ok(());
        }
        if self.binding.as_ref().is_some_and(|b| b.stream.is_none()) {
            self.try_start(conn)?;
        }

        // backpressure: let the socket drain before queueing more media
        if conn.buffer_bytes() > send_high_watermark {
            return Ok(());
        }

        self.send_video(conn, tcp_info)?;
        self.send_audio(conn)?;
        Ok(())
    }

    /// Resolves the starting timestamps and sends `server-init`. Stays
    /// pending (returning Ok) while the channel lacks enough ready
    /// history.
    fn try_start(&mut self, conn: &mut WsConnection) -> Result<(), SessionError> {
        let Some(binding) = self.binding.as_mut() else {
            return Ok(());
        };
        if binding.stream.is_some() {
            return Ok(());
        }

        let store = binding.channel.read();

        let (vts, can_resume) = match binding.resume_vts {
            Some(requested) => {
                let evicted = store.vclean_frontier().is_some_and(|f| requested <= f);
                if evicted {
                    return Err(SessionError::ResumeEvicted(requested));
                }
                if store.vready(requested) {
                    (requested, true)
                } else {
                    // requested point not there (yet); fall back to a
                    // fresh start at the live edge
                    match store.init_vts(self.max_buffer_s) {
                        Some(vts) => (vts, false),
                        None => return Ok(()),
                    }
                }
            }
            None => match store.init_vts(self.max_buffer_s) {
                Some(vts) => (vts, false),
                None => return Ok(()),
            },
        };

        let ats = match (can_resume, binding.resume_ats) {
            (true, Some(ats)) => ats,
            _ => store.find_ats(vts),
        };

        let msg = ServerMessage::Init {
            channel: binding.channel.name().to_string(),
            video_codec: binding.channel.vcodec().to_string(),
            audio_codec: binding.channel.acodec().to_string(),
            timescale: store.timescale(),
            init_video_timestamp: vts,
            init_audio_timestamp: ats,
            init_id: binding.init_id,
            can_resume,
        };
        drop(store);

        log::info!(
            "[conn {}] server-init: channel={} vts={} ats={} resume={}",
            self.connection_id,
            binding.channel.name(),
            vts,
            ats,
            can_resume
        );

        conn.queue_frame(&Frame::binary(pack(&msg)?));
        binding.stream = Some(Stream::new(vts, ats));
        Ok(())
    }

    fn send_video(
        &mut self,
        conn: &mut WsConnection,
        tcp_info: Option<TcpInfo>,
    ) -> Result<(), SessionError> {
        let max_buffer_s = self.max_buffer_s;
        let Some(binding) = self.binding.as_mut() else {
            return Ok(());
        };
        let Some(stream) = binding.stream.as_mut() else {
            return Ok(());
        };

        let store = binding.channel.read();
        let vduration = u64::from(store.vduration());

        if stream.video_playback_buf >= max_buffer_s
            || stream.video_in_flight_chunks(vduration) >= MAX_VIDEO_IN_FLIGHT_CHUNKS
            || !store.vready(stream.next_vts)
        {
            return Ok(());
        }

        stream.last_tcp_info = tcp_info;

        let view = SessionView {
            video_playback_buf: stream.video_playback_buf,
            max_buffer_s,
            next_vts: stream.next_vts,
            curr_vformat: stream.curr_vformat,
            tcp_info: stream.last_tcp_info,
        };
        let vf = binding.abr.select_video_format(&view, &store)?;

        // vready guarantees data, ssim, and init are all present
        let data = store
            .vdata(vf, stream.next_vts)
            .ok_or_else(|| AbrError::MissingData(format!("{vf} at {}", stream.next_vts)))?
            .clone();
        let ssim = store.vssim(vf, stream.next_vts).unwrap_or(0.0);
        let init = if stream.init_sent_vformats.contains(&vf) {
            None
        } else {
            store.vinit(vf).cloned()
        };

        let mut segment = MediaSegment::new(data, init);
        let total = segment.total_len() as u64;

        let msg = ServerMessage::Video {
            channel: binding.channel.name().to_string(),
            quality: vf.to_string(),
            ssim,
            timestamp: stream.next_vts,
            duration: store.vduration(),
            byte_offset: 0,
            byte_length: total,
            total_byte_length: total,
        };
        drop(store);

        conn.queue_frame(&Frame::binary(pack(&msg)?));
        loop {
            let piece = segment.read(MEDIA_FRAME_MAX_BYTES);
            if piece.is_empty() {
                break;
            }
            conn.queue_frame(&Frame::binary(piece));
        }

        log::debug!(
            "[conn {}] server-video: ts={} format={} bytes={}",
            self.connection_id,
            stream.next_vts,
            vf,
            total
        );

        stream.init_sent_vformats.insert(vf);
        stream.curr_vformat = Some(vf);
        stream.next_vts += vduration;
        stream.last_video_send = Some(Instant::now());
        Ok(())
    }

    fn send_audio(&mut self, conn: &mut WsConnection) -> Result<(), SessionError> {
        let max_buffer_s = self.max_buffer_s;
        let Some(binding) = self.binding.as_mut() else {
            return Ok(());
        };
        let Some(stream) = binding.stream.as_mut() else {
            return Ok(());
        };

        let store = binding.channel.read();
        let aduration = u64::from(store.aduration());

        if stream.audio_playback_buf >= max_buffer_s || !store.aready(stream.next_ats) {
            return Ok(());
        }

        let af = select_audio_format(
            stream.audio_playback_buf,
            max_buffer_s,
            &store,
            stream.next_ats,
        )?;

        let data = store
            .adata(af, stream.next_ats)
            .ok_or_else(|| AbrError::MissingData(format!("{af} at {}", stream.next_ats)))?
            .clone();
        let init = if stream.init_sent_aformats.contains(&af) {
            None
        } else {
            store.ainit(af).cloned()
        };

        let mut segment = MediaSegment::new(data, init);
        let total = segment.total_len() as u64;

        let msg = ServerMessage::Audio {
            channel: binding.channel.name().to_string(),
            quality: af.to_string(),
            timestamp: stream.next_ats,
            duration: store.aduration(),
            byte_offset: 0,
            byte_length: total,
            total_byte_length: total,
        };
        drop(store);

        conn.queue_frame(&Frame::binary(pack(&msg)?));
        loop {
            let piece = segment.read(MEDIA_FRAME_MAX_BYTES);
            if piece.is_empty() {
                break;
            }
            conn.queue_frame(&Frame::binary(piece));
        }

        log::debug!(
            "[conn {}] server-audio: ts={} format={} bytes={}",
            self.connection_id,
            stream.next_ats,
            af,
            total
        );

        stream.init_sent_aformats.insert(af);
        stream.curr_aformat = Some(af);
        stream.next_ats += aduration;
        stream.last_audio_send = Some(Instant::now());
        Ok(())
    }
}
