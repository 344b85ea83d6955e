use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gw_backend::{DiskPrefixCache, PrefixCache, RamPrefixCache, StopChecker, StopOutcome};
use gw_types::{CachePolicy, CompletionState, CompletionStatus, GenerationRequest, ModelDescriptor};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PoolError;
use crate::generator::Generator;
use crate::ipc::{self, WireCommand, WireEvent};
use crate::lru::{GeneratorKind, ModelLru};

/// One decoded piece of a streaming generation, sent from the worker
/// process back to the (async) dispatcher.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    Token(String),
    Done(CompletionStatus),
    Error(String),
}

/// An outstanding command, waiting for the worker process's reply.
/// Replies arrive on stdout in the same order commands were written on
/// stdin (the worker is single-job-at-a-time), so a plain FIFO is enough
/// to route each event back to its caller.
enum PendingSlot {
    Generate(mpsc::UnboundedSender<TokenEvent>),
    Embed(oneshot::Sender<Result<Vec<f32>, PoolError>>),
}

fn drain_as_gone(pending: &Mutex<VecDeque<PendingSlot>>, index: usize) {
    let mut queue = pending.lock().unwrap();
    while let Some(slot) = queue.pop_front() {
        match slot {
            PendingSlot::Generate(tx) => {
                let _ = tx.send(TokenEvent::Error(PoolError::WorkerGone(index).to_string()));
            }
            PendingSlot::Embed(reply_tx) => {
                let _ = reply_tx.send(Err(PoolError::WorkerGone(index)));
            }
        }
    }
}

fn route_event(pending: &Mutex<VecDeque<PendingSlot>>, event: WireEvent) {
    let mut queue = pending.lock().unwrap();
    match event {
        WireEvent::Token(text) => {
            if let Some(PendingSlot::Generate(tx)) = queue.front() {
                let _ = tx.send(TokenEvent::Token(text));
            }
        }
        WireEvent::Error(msg) => {
            if let Some(PendingSlot::Generate(tx)) = queue.front() {
                let _ = tx.send(TokenEvent::Error(msg));
            }
        }
        WireEvent::Done(status) => {
            if let Some(PendingSlot::Generate(tx)) = queue.front() {
                let _ = tx.send(TokenEvent::Done(status));
            }
            queue.pop_front();
        }
        WireEvent::EmbedOk(embedding) => {
            if matches!(queue.front(), Some(PendingSlot::Embed(_))) {
                if let Some(PendingSlot::Embed(reply_tx)) = queue.pop_front() {
                    let _ = reply_tx.send(Ok(embedding));
                }
            }
        }
        WireEvent::EmbedErr(msg) => {
            if matches!(queue.front(), Some(PendingSlot::Embed(_))) {
                if let Some(PendingSlot::Embed(reply_tx)) = queue.pop_front() {
                    let _ = reply_tx.send(Err(PoolError::BackendFailure(msg)));
                }
            }
        }
    }
}

/// The parent-process half of one worker: an actual child OS process
/// (spawned by re-executing this same binary with `--worker-process`)
/// plus the pipe and bookkeeping needed to talk to it. Isolating the
/// native backend in its own process, not a thread, is what lets a
/// recycle actually free leaked device/native memory: the old process
/// exits, the OS reclaims everything it held, and a fresh one is spawned
/// in its place.
struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    pending: Arc<Mutex<VecDeque<PendingSlot>>>,
    exited: Arc<AtomicBool>,
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

fn spawn_reader_thread(index: usize, stdout: ChildStdout, pending: Arc<Mutex<VecDeque<PendingSlot>>>, exited: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(worker = index, error = %e, "worker process stdout read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WireEvent>(&line) {
                Ok(event) => route_event(&pending, event),
                Err(e) => warn!(worker = index, error = %e, "failed to parse worker process event"),
            }
        }
        exited.store(true, Ordering::Relaxed);
        drain_as_gone(&pending, index);
    });
}

fn spawn_child(
    index: usize,
    lru_capacity: usize,
    recycle_after_evictions: u64,
    gpu_layers: u32,
    model_load_timeout: Duration,
) -> WorkerProcess {
    let exe = std::env::current_exe().expect("gateway binary path must be resolvable to spawn a worker process");

    let mut child = Command::new(exe)
        .arg("--worker-process")
        .arg("--lru-capacity")
        .arg(lru_capacity.to_string())
        .arg("--recycle-after-evictions")
        .arg(recycle_after_evictions.to_string())
        .arg("--gpu-layers")
        .arg(gpu_layers.to_string())
        .arg("--model-load-timeout-secs")
        .arg(model_load_timeout.as_secs().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn worker process");

    let stdin = child.stdin.take().expect("child stdin was piped");
    let stdout = child.stdout.take().expect("child stdout was piped");
    let pending = Arc::new(Mutex::new(VecDeque::new()));
    let exited = Arc::new(AtomicBool::new(false));

    spawn_reader_thread(index, stdout, pending.clone(), exited.clone());
    info!(worker = index, pid = child.id(), "spawned worker process");

    WorkerProcess {
        child,
        stdin,
        pending,
        exited,
    }
}

/// Dispatcher-facing handle to one worker. The affinity key and
/// semaphore are owned here, in the gateway's own process — the worker
/// process itself never touches them.
pub struct WorkerHandle {
    pub index: usize,
    pub affinity: Mutex<Option<String>>,
    pub semaphore: Arc<tokio::sync::Semaphore>,
    process: Mutex<WorkerProcess>,
    lru_capacity: usize,
    recycle_after_evictions: u64,
    gpu_layers: u32,
    model_load_timeout: Duration,
}

impl WorkerHandle {
    pub fn spawn(
        index: usize,
        max_semaphores: usize,
        lru_capacity: usize,
        recycle_after_evictions: u64,
        gpu_layers: u32,
        model_load_timeout: Duration,
    ) -> Arc<Self> {
        let process = spawn_child(index, lru_capacity, recycle_after_evictions, gpu_layers, model_load_timeout);

        Arc::new(Self {
            index,
            affinity: Mutex::new(None),
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_semaphores)),
            process: Mutex::new(process),
            lru_capacity,
            recycle_after_evictions,
            gpu_layers,
            model_load_timeout,
        })
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Write `cmd` to the worker process's stdin, respawning it first if
    /// the previous process has exited (a crash, or a clean recycle
    /// exit after the eviction threshold). `slot` is queued before the
    /// write so the reader thread can always find it once a reply shows
    /// up on stdout.
    fn dispatch(&self, cmd: WireCommand, slot: PendingSlot) -> Result<(), PoolError> {
        let mut guard = self.process.lock().unwrap();
        if guard.exited.load(Ordering::Relaxed) {
            info!(worker = self.index, "worker process is gone; spawning a replacement");
            *guard = spawn_child(
                self.index,
                self.lru_capacity,
                self.recycle_after_evictions,
                self.gpu_layers,
                self.model_load_timeout,
            );
        }

        guard.pending.lock().unwrap().push_back(slot);
        if let Err(e) = ipc::write_line(&mut guard.stdin, &cmd) {
            warn!(worker = self.index, error = %e, "failed to write to worker process stdin");
            guard.pending.lock().unwrap().pop_back();
            guard.exited.store(true, Ordering::Relaxed);
            return Err(PoolError::WorkerGone(self.index));
        }
        Ok(())
    }

    fn send_cancel(&self, request_id: Uuid) {
        let mut guard = self.process.lock().unwrap();
        if let Err(e) = ipc::write_line(&mut guard.stdin, &WireCommand::Cancel { request_id }) {
            warn!(worker = self.index, error = %e, "failed to forward cancellation to worker process");
        }
    }

    pub async fn generate(
        self: Arc<Self>,
        request_id: Uuid,
        request: GenerationRequest,
        descriptor: ModelDescriptor,
    ) -> (mpsc::UnboundedReceiver<TokenEvent>, Arc<AtomicBool>) {
        let (token_tx, token_rx) = mpsc::unbounded_channel();
        let interrupt = Arc::new(AtomicBool::new(false));

        let cmd = WireCommand::Generate {
            request_id,
            request,
            descriptor,
        };
        if let Err(e) = self.dispatch(cmd, PendingSlot::Generate(token_tx.clone())) {
            let _ = token_tx.send(TokenEvent::Error(e.to_string()));
            return (token_rx, interrupt);
        }

        // `interrupt` lives in this (dispatcher) process; the generation
        // loop that must observe it runs in the worker process. Forward
        // it over the wire as soon as it's set, and stop polling as soon
        // as the caller has dropped its receiver or the worker is done.
        let watch_interrupt = interrupt.clone();
        let watch_tx = token_tx;
        let watch_self = self.clone();
        tokio::spawn(async move {
            loop {
                if watch_tx.is_closed() {
                    return;
                }
                if watch_interrupt.load(Ordering::Relaxed) {
                    watch_self.send_cancel(request_id);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        (token_rx, interrupt)
    }

    pub async fn embed(self: Arc<Self>, descriptor: ModelDescriptor, text: String) -> Result<Vec<f32>, PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(WireCommand::Embed { descriptor, text }, PendingSlot::Embed(reply_tx))?;
        reply_rx.await.map_err(|_| PoolError::WorkerGone(self.index))?
    }
}

/// Options for the worker-process entry point, parsed from argv by the
/// gateway binary when it re-execs itself with `--worker-process`.
pub struct WorkerProcessOptions {
    pub lru_capacity: usize,
    pub recycle_after_evictions: u64,
    pub gpu_layers: u32,
    pub model_load_timeout: Duration,
}

/// The worker process's entire body: reads `WireCommand`s from stdin,
/// runs them against a resident-model LRU exactly as the old in-process
/// worker thread did, and writes `WireEvent`s to stdout. Returns when
/// stdin is closed (the parent exited or dropped this worker), a
/// `Shutdown` command arrives, or the eviction-recycle threshold is
/// crossed; in the last case the caller (`main`) should let the process
/// exit immediately afterward, which is what actually reclaims any
/// native memory the backend leaked.
pub fn run_worker_process(opts: WorkerProcessOptions) {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    let mut lru = ModelLru::new(opts.lru_capacity.max(1));

    // Commands are read off stdin on a dedicated thread so a `Cancel`
    // for the in-flight `Generate` can be observed while the main loop
    // below is blocked inside the backend's decode step.
    let (cmd_tx, cmd_rx) = std_mpsc::channel::<WireCommand>();
    let current: Arc<Mutex<Option<(Uuid, Arc<AtomicBool>)>>> = Arc::new(Mutex::new(None));
    let reader_current = current.clone();
    std::thread::spawn(move || {
        let reader = BufReader::new(stdin.lock());
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let cmd: WireCommand = match serde_json::from_str(&line) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("worker: failed to parse command: {e}");
                    continue;
                }
            };
            match cmd {
                WireCommand::Cancel { request_id } => {
                    if let Some((id, flag)) = reader_current.lock().unwrap().as_ref() {
                        if *id == request_id {
                            flag.store(true, Ordering::Relaxed);
                        }
                    }
                }
                other => {
                    if cmd_tx.send(other).is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            WireCommand::Generate {
                request_id,
                request,
                descriptor,
            } => {
                let interrupt = Arc::new(AtomicBool::new(false));
                *current.lock().unwrap() = Some((request_id, interrupt.clone()));
                handle_generate(
                    &mut lru,
                    request_id,
                    request,
                    descriptor,
                    &mut stdout,
                    &interrupt,
                    opts.gpu_layers,
                    opts.model_load_timeout,
                );
                *current.lock().unwrap() = None;
            }
            WireCommand::Embed { descriptor, text } => {
                let event = match handle_embed(&mut lru, descriptor, &text, opts.gpu_layers, opts.model_load_timeout) {
                    Ok(embedding) => WireEvent::EmbedOk(embedding),
                    Err(e) => WireEvent::EmbedErr(e.to_string()),
                };
                let _ = ipc::write_line(&mut stdout, &event);
            }
            WireCommand::Cancel { .. } => {}
            WireCommand::Shutdown => break,
        }

        if opts.recycle_after_evictions > 0 && lru.evictions() >= opts.recycle_after_evictions {
            info!(
                evictions = lru.evictions(),
                "eviction threshold reached; exiting to free this worker's process-local memory"
            );
            return;
        }
    }
}

fn load_generator(descriptor: &ModelDescriptor, gpu_layers: u32, timeout: Duration) -> Result<Generator, PoolError> {
    let (tx, rx) = std_mpsc::channel();
    let descriptor_clone = descriptor.clone();
    std::thread::spawn(move || {
        let result = build_backend(&descriptor_clone, gpu_layers);
        let _ = tx.send(result);
    });

    let backend = match rx.recv_timeout(timeout) {
        Ok(Ok(backend)) => backend,
        Ok(Err(e)) => return Err(PoolError::BackendFailure(e.to_string())),
        Err(_) => return Err(PoolError::ModelLoadTimeout(timeout.as_secs())),
    };

    let prefix_cache = build_prefix_cache(descriptor);
    Ok(Generator::new(descriptor.clone(), backend, prefix_cache))
}

fn build_backend(descriptor: &ModelDescriptor, gpu_layers: u32) -> Result<Box<dyn gw_backend::InferenceBackend>, PoolError> {
    match descriptor.backend {
        #[cfg(feature = "llama")]
        gw_types::BackendKind::GgufLlama => {
            let backend = gw_backend::llama::LlamaBackend::load(
                &descriptor.path,
                descriptor.context_size,
                gpu_layers,
                descriptor.params.embedding_enabled,
            )
            .map_err(|e| PoolError::BackendFailure(e.to_string()))?;
            Ok(Box::new(backend))
        }
        #[cfg(feature = "candle")]
        gw_types::BackendKind::CandleDirectory => {
            let backend = gw_backend::candle_backend::CandleBackend::load(&descriptor.path, descriptor.params.embedding_enabled)
                .map_err(|e| PoolError::BackendFailure(e.to_string()))?;
            Ok(Box::new(backend))
        }
        #[allow(unreachable_patterns)]
        _ => Err(PoolError::BackendFailure(format!("no backend compiled in for {:?}", descriptor.backend))),
    }
}

fn build_prefix_cache(descriptor: &ModelDescriptor) -> Option<Arc<dyn PrefixCache>> {
    match &descriptor.cache_policy {
        CachePolicy::Off => None,
        CachePolicy::Ram { capacity_bytes } => Some(Arc::new(RamPrefixCache::new(*capacity_bytes))),
        CachePolicy::Disk { capacity_bytes, dir } => match DiskPrefixCache::open(dir.clone(), *capacity_bytes) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(error = %e, "failed to open disk prefix cache, falling back to no cache");
                None
            }
        },
    }
}

fn handle_generate(
    lru: &mut ModelLru,
    request_id: Uuid,
    request: GenerationRequest,
    descriptor: ModelDescriptor,
    out: &mut impl Write,
    interrupt: &AtomicBool,
    gpu_layers: u32,
    model_load_timeout: Duration,
) {
    if lru.find_and_touch(&descriptor.id).is_none() {
        lru.make_room(&GeneratorKind::Completion);
        let generator = match load_generator(&descriptor, gpu_layers, model_load_timeout) {
            Ok(g) => g,
            Err(e) => {
                let _ = ipc::write_line(&mut *out, &WireEvent::Error(e.to_string()));
                let mut status = CompletionStatus::new(request_id, request.prompt.clone());
                status.finish(CompletionState::Interrupted);
                let _ = ipc::write_line(&mut *out, &WireEvent::Done(status));
                return;
            }
        };
        lru.insert(GeneratorKind::Completion, generator);
        lru.find_and_touch(&descriptor.id);
    }
    let generator = lru.find_and_touch(&descriptor.id).expect("generator was just inserted");

    let (status, backend_failure) = run_generation_loop(generator, request_id, &request, out, interrupt);
    if backend_failure {
        lru.remove(&descriptor.id);
        warn!(model = %descriptor.id, "evicting generator from the resident LRU after a backend failure");
    }
    let _ = ipc::write_line(out, &WireEvent::Done(status));
}

fn handle_embed(
    lru: &mut ModelLru,
    descriptor: ModelDescriptor,
    text: &str,
    gpu_layers: u32,
    model_load_timeout: Duration,
) -> Result<Vec<f32>, PoolError> {
    if lru.find_and_touch(&descriptor.id).is_none() {
        lru.make_room(&GeneratorKind::Embedding);
        let generator = load_generator(&descriptor, gpu_layers, model_load_timeout)?;
        lru.insert(GeneratorKind::Embedding, generator);
        lru.find_and_touch(&descriptor.id);
    }
    let generator = lru.find_and_touch(&descriptor.id).expect("generator was just inserted");

    let result = generator.backend.embed(text).map_err(|e| e.to_string());
    match result {
        Ok(embedding) => Ok(embedding),
        Err(msg) => {
            lru.remove(&descriptor.id);
            Err(PoolError::BackendFailure(msg))
        }
    }
}

/// The per-worker generation loop: warms the backend from the
/// prefix cache when it helps, steps the backend one token at a time,
/// resynchronizes UTF-8 across token boundaries, runs the stop-string
/// checker, and writes back to the prefix cache on clean termination
/// only. Returns the final status plus whether a backend failure (as
/// opposed to a client-initiated interruption) caused generation to end,
/// so the caller can evict the generator that produced it.
fn run_generation_loop(
    generator: &mut Generator,
    request_id: Uuid,
    request: &GenerationRequest,
    out: &mut impl Write,
    interrupt: &AtomicBool,
) -> (CompletionStatus, bool) {
    let started = Instant::now();
    let mut status = CompletionStatus::new(request_id, request.prompt.clone());

    let prompt_tokens = match generator.backend.tokenize(&request.prompt) {
        Ok(tokens) => tokens,
        Err(e) => {
            status.finish(CompletionState::Interrupted);
            let _ = ipc::write_line(&mut *out, &WireEvent::Error(e.to_string()));
            return (status, true);
        }
    };

    let caps = generator.backend.capabilities();
    let eval_prefix_len = gw_backend::prefix_cache::common_prefix_len(&prompt_tokens, &generator.last_evaluated);
    let mut warm_from = eval_prefix_len;

    // `load_state`/`save_state` below are only trusted for backends that
    // advertise `supports_state_resume`; others only round-trip a
    // placeholder (see their `capabilities()`), which would desync the
    // resumed position from the attention state actually loaded.
    if caps.supports_state_resume {
        if let Some(cache) = generator.prefix_cache.as_ref() {
            if let Some(hit) = cache.get_longest_prefix(&prompt_tokens) {
                if hit.prefix_len > eval_prefix_len {
                    if generator.backend.load_state(&hit.state).is_ok() {
                        warm_from = hit.prefix_len;
                    } else {
                        warn!("prefix cache state failed to load; continuing without it");
                    }
                }
            }
        }
    }

    if warm_from < prompt_tokens.len() {
        if let Err(e) = generator.backend.warm(&prompt_tokens[warm_from..]) {
            status.finish(CompletionState::Interrupted);
            let _ = ipc::write_line(&mut *out, &WireEvent::Error(e.to_string()));
            return (status, true);
        }
    }

    generator.statuses.insert(request_id, status.clone());

    let mut stop_checker = StopChecker::new(request.settings.stop.clone());
    let mut utf8_buffer: Vec<u8> = Vec::new();
    let mut generated_ids: Vec<i32> = Vec::new();
    let mut final_state = CompletionState::Done;
    let mut backend_failure = false;

    for step in 0..request.settings.max_tokens {
        if interrupt.load(Ordering::Relaxed) {
            final_state = CompletionState::Interrupted;
            break;
        }

        let token = match generator.backend.sample_next(&request.settings, step) {
            Ok(t) => t,
            Err(e) => {
                let _ = ipc::write_line(&mut *out, &WireEvent::Error(e.to_string()));
                final_state = CompletionState::Interrupted;
                backend_failure = true;
                break;
            }
        };

        if generator.backend.is_eos(token) {
            break;
        }
        generated_ids.push(token);
        // Count every generated token immediately, independent of
        // whether the stop checker later withholds or discards the text
        // it decodes to — the client-visible text and the raw token
        // count are tracked separately from here on.
        status.count_token();

        match generator.backend.detokenize_one(token) {
            Ok(bytes) => utf8_buffer.extend_from_slice(&bytes),
            Err(e) => {
                warn!(error = %e, "detokenize error; skipping token");
                continue;
            }
        }

        // A multi-byte character can straddle a token boundary: on a
        // decode failure, emit the longest valid prefix and keep the
        // remaining incomplete bytes buffered for the next iteration.
        let text_piece = match String::from_utf8(utf8_buffer.clone()) {
            Ok(s) => {
                utf8_buffer.clear();
                Some(s)
            }
            Err(_) => {
                let mut valid_len = 0;
                for i in (1..=utf8_buffer.len()).rev() {
                    if std::str::from_utf8(&utf8_buffer[..i]).is_ok() {
                        valid_len = i;
                        break;
                    }
                }
                if valid_len > 0 {
                    let piece = String::from_utf8(utf8_buffer[..valid_len].to_vec()).unwrap();
                    utf8_buffer = utf8_buffer[valid_len..].to_vec();
                    Some(piece)
                } else {
                    None
                }
            }
        };
        let text_piece = text_piece.filter(|s| !s.is_empty());

        if let Some(piece) = text_piece {
            match stop_checker.feed(&piece) {
                StopOutcome::Matched => {
                    final_state = CompletionState::Done;
                    break;
                }
                StopOutcome::Withheld => {}
                StopOutcome::Yield(text) => {
                    if !text.is_empty() {
                        status.append_text(&text);
                        let _ = ipc::write_line(&mut *out, &WireEvent::Token(text));
                    }
                }
            }
        }
    }

    if generated_ids.len() as u32 >= request.settings.max_tokens {
        final_state = CompletionState::Done;
    }

    status.finish(final_state);

    let mut combined = prompt_tokens.clone();
    combined.extend_from_slice(&generated_ids);
    generator.last_evaluated = combined.clone();

    if final_state != CompletionState::Interrupted && caps.supports_state_resume {
        if let Some(cache) = generator.prefix_cache.as_ref() {
            match generator.backend.save_state() {
                Ok(state) => cache.put(&combined, state),
                Err(e) => warn!(error = %e, "failed to save backend state for prefix cache write-back"),
            }
        }
    }

    generator.statuses.remove(&request_id);

    let elapsed = started.elapsed().as_secs_f64();
    let tps = if elapsed > 0.0 { status.generated_tokens as f64 / elapsed } else { 0.0 };
    info!(
        request_id = %request_id,
        model = %generator.descriptor.id,
        elapsed_secs = elapsed,
        tokens = status.generated_tokens,
        tokens_per_second = tps,
        "completion finished"
    );
    tracing::info!(
        target: "chat_log",
        request_id = %request_id,
        model = %generator.descriptor.id,
        prompt = %request.prompt,
        response = %status.generated_text,
        "chat exchange"
    );

    (status, backend_failure)
}
