use super::{
    CancelToken, CaptureConfig, CaptureError, CaptureObserver, CaptureStats,
};
use crate::hook::{
    HOOK_BUFFER_SIZE, HookDispatcher, HookOutcome, IoHookBuffer, Service,
};
use crate::patch::{HwPatch, load_patch, push_region};
use crate::trace::{
    BurstKind, DecodeError, DecoderState, Packet, PacketFramer, PacketType,
    stream_start,
};
use crate::transport::{
    REG_TRACE_FLAGS, TRACE_READS, TRACE_RESET, TRACE_WRITES, Transport,
};
use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Write};

//===========================================================================//

/// One capture session: owns the patch for the session's duration, and
/// streams the trace from a [`Transport`] through the decoder.
pub struct CaptureSession {
    config: CaptureConfig,
    patch: HwPatch,
    dispatcher: Option<HookDispatcher>,
    cancel: CancelToken,
}

impl CaptureSession {
    /// Prepares a session around `patch`.
    ///
    /// If hooks are enabled and the patch has no region at the hook address,
    /// a hook-sized region is allocated there.
    pub fn new(
        config: CaptureConfig,
        mut patch: HwPatch,
    ) -> Result<CaptureSession, CaptureError> {
        let dispatcher = if config.enable_hooks {
            let region = match patch.region_at(config.hook_addr) {
                Some(region) => region,
                None => patch
                    .allocate_with(config.hook_addr, &[0; HOOK_BUFFER_SIZE])?,
            };
            if region.len() < HOOK_BUFFER_SIZE {
                return Err(CaptureError::HookRegionTooSmall {
                    addr: config.hook_addr,
                    len: region.len(),
                });
            }
            Some(HookDispatcher::new(region))
        } else {
            None
        };
        Ok(CaptureSession {
            config,
            patch,
            dispatcher,
            cancel: CancelToken::new(),
        })
    }

    /// Returns the session's configuration.
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Returns the session's patch, including any hook responses written so
    /// far.
    pub fn patch(&self) -> &HwPatch {
        &self.patch
    }

    /// Returns the hook dispatcher, or `None` if hooks are disabled.
    pub fn dispatcher(&self) -> Option<&HookDispatcher> {
        self.dispatcher.as_ref()
    }

    /// Registers a hook service.  Does nothing if hooks are disabled.
    pub fn register_service<S: Service + 'static>(
        &mut self,
        service_id: u8,
        service: S,
    ) {
        match self.dispatcher.as_mut() {
            Some(dispatcher) => dispatcher.register(service_id, service),
            None => log::debug!(
                "hooks disabled, ignoring service {service_id:#04x}"
            ),
        }
    }

    /// Returns a token that stops [`CaptureSession::run`] when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the capture until the stream ends, the session is cancelled, or
    /// a fatal error occurs.
    ///
    /// Every chunk is written to `raw_sink` (if any) before it is decoded.
    /// Tracing is switched off and the raw sink flushed on every exit path.
    pub fn run<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        mut raw_sink: Option<&mut dyn Write>,
        observer: &mut dyn CaptureObserver,
    ) -> Result<CaptureStats, CaptureError> {
        let mut flags = TRACE_WRITES;
        if raw_sink.is_some() {
            flags |= TRACE_READS;
        }
        if let Err(error) = self.start(transport, flags) {
            let stopped = transport.write_register(REG_TRACE_FLAGS, 0);
            if let Err(stop_error) = stopped {
                log::warn!("failed to stop tracing: {stop_error}");
            }
            return Err(CaptureError::Transport(error));
        }
        log::info!(
            "capture started (hooks {}, reads {})",
            if self.dispatcher.is_some() { "on" } else { "off" },
            if flags & TRACE_READS != 0 { "traced" } else { "untraced" }
        );
        let result = self.stream(transport, &mut raw_sink, observer);
        let stopped = transport.write_register(REG_TRACE_FLAGS, 0);
        let flushed = match raw_sink {
            Some(sink) => sink.flush(),
            None => Ok(()),
        };
        let stats = match result {
            Ok(stats) => stats,
            Err(error) => {
                if let Err(stop_error) = stopped {
                    log::warn!("failed to stop tracing: {stop_error}");
                }
                log::error!("capture aborted: {error}");
                return Err(error);
            }
        };
        stopped.map_err(CaptureError::Transport)?;
        flushed.map_err(CaptureError::RawSink)?;
        log::info!("capture finished: {stats}");
        Ok(stats)
    }

    fn start<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        flags: u16,
    ) -> io::Result<()> {
        transport.write_register(REG_TRACE_FLAGS, 0)?;
        load_patch(transport, &self.patch)?;
        if self.config.reset_target {
            transport.write_register(REG_TRACE_FLAGS, TRACE_RESET)?;
            transport.write_register(REG_TRACE_FLAGS, 0)?;
        }
        // Leftover bytes from an earlier session would break packet framing.
        transport.drain()?;
        transport.write_register(REG_TRACE_FLAGS, flags)
    }

    fn stream<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        raw_sink: &mut Option<&mut dyn Write>,
        observer: &mut dyn CaptureObserver,
    ) -> Result<CaptureStats, CaptureError> {
        let mut state = StreamState::new();
        let mut buffer = Vec::new();
        let mut started = false;
        while !self.cancel.is_cancelled() {
            let more = transport
                .read_chunk(&mut buffer)
                .map_err(CaptureError::Transport)?;
            if !more {
                log::debug!("end of trace stream");
                break;
            }
            state.stats.chunks += 1;
            let mut chunk = buffer.as_slice();
            if !started {
                match stream_start(chunk) {
                    Some(offset) => {
                        chunk = &chunk[offset..];
                        started = true;
                    }
                    None => continue,
                }
            }
            if let Some(sink) = raw_sink.as_mut() {
                sink.write_all(chunk).map_err(CaptureError::RawSink)?;
            }
            state.stats.bytes += chunk.len() as u64;
            state.framer.push(chunk);
            while let Some(result) = state.framer.next_packet() {
                self.packet(&mut state, result, transport, observer)?;
            }
        }
        if let Some(burst) = state.decoder.finish() {
            state.stats.bursts += 1;
            observer.burst(&burst);
        }
        state.stats.timestamp = state.decoder.timestamp();
        Ok(state.stats)
    }

    fn packet<T: Transport + ?Sized>(
        &mut self,
        state: &mut StreamState,
        result: Result<Packet, DecodeError>,
        transport: &mut T,
        observer: &mut dyn CaptureObserver,
    ) -> Result<(), CaptureError> {
        let packet = match result {
            Ok(packet) => packet,
            Err(error) => {
                state.stats.sync_errors += 1;
                report(&error, observer);
                return Ok(());
            }
        };
        state.stats.packets += 1;
        if !packet.is_checksum_valid() {
            state.stats.checksum_errors += 1;
            report(&DecodeError::Checksum { word: packet.word() }, observer);
        }
        match state.decoder.advance(packet) {
            Ok(Some(burst)) => {
                state.stats.bursts += 1;
                log::debug!(
                    "{:?} burst at {:#08x}, {} bytes",
                    burst.kind(),
                    burst.start(),
                    burst.len()
                );
                observer.burst(&burst);
            }
            Ok(None) => {}
            Err(error @ DecodeError::Overflow { clocks }) => {
                observer.decode_error(&error);
                return Err(CaptureError::Overflow { clocks });
            }
            Err(error) => {
                state.stats.malformed_bursts += 1;
                report(&error, observer);
            }
        }
        if packet.packet_type() == PacketType::Write {
            self.feed_hook(state, transport, observer)?;
        }
        Ok(())
    }

    /// Copies newly completed words of a write burst at the hook address
    /// into the hook buffer, dispatching the call once the last word lands.
    fn feed_hook<T: Transport + ?Sized>(
        &mut self,
        state: &mut StreamState,
        transport: &mut T,
        observer: &mut dyn CaptureObserver,
    ) -> Result<(), CaptureError> {
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return Ok(());
        };
        let Some(burst) = state.decoder.open_burst() else {
            return Ok(());
        };
        if burst.kind() != BurstKind::Write
            || burst.start() != self.config.hook_addr
        {
            return Ok(());
        }
        let hook = &mut state.hook;
        if hook.serial != Some(burst.serial()) {
            *hook = HookProgress::begin(burst.serial());
        }
        while !hook.dispatched && hook.words_fed < burst.len() / 2 {
            let index = hook.words_fed;
            let word = LittleEndian::read_u16(&burst.data()[2 * index..]);
            hook.words_fed += 1;
            if !hook.buffer.store(index, word) {
                continue;
            }
            hook.dispatched = true;
            state.stats.hook_calls += 1;
            let outcome =
                dispatcher.on_buffer_complete(&hook.buffer, &mut self.patch);
            match outcome {
                Ok(HookOutcome::Handled) => {}
                Ok(HookOutcome::Responded) => {
                    push_region(transport, &self.patch, dispatcher.region())
                        .map_err(CaptureError::Transport)?;
                }
                Err(error) => {
                    state.stats.hook_errors += 1;
                    log::warn!("dropped hook call: {error}");
                    observer.hook_error(&error);
                }
            }
        }
        Ok(())
    }
}

fn report(error: &DecodeError, observer: &mut dyn CaptureObserver) {
    log::warn!("{error}");
    observer.decode_error(error);
}

//===========================================================================//

struct HookProgress {
    serial: Option<u64>,
    buffer: IoHookBuffer,
    words_fed: usize,
    dispatched: bool,
}

impl HookProgress {
    fn idle() -> HookProgress {
        HookProgress {
            serial: None,
            buffer: IoHookBuffer::new(),
            words_fed: 0,
            dispatched: false,
        }
    }

    fn begin(serial: u64) -> HookProgress {
        HookProgress { serial: Some(serial), ..HookProgress::idle() }
    }
}

struct StreamState {
    decoder: DecoderState,
    framer: PacketFramer,
    hook: HookProgress,
    stats: CaptureStats,
}

impl StreamState {
    fn new() -> StreamState {
        StreamState {
            decoder: DecoderState::new(),
            framer: PacketFramer::new(),
            hook: HookProgress::idle(),
            stats: CaptureStats::default(),
        }
    }
}

//===========================================================================//
