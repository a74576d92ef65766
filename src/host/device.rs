use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use ash::vk;
use bytemuck::Pod;

use super::kernels::{self, Kernel, KernelArgs};
use crate::device::{
    find_memorytype_index, BarrierScope, BindingDescriptor, ComputeDevice, DeviceError,
    MemoryRequirements,
};

#[derive(Debug, Clone)]
pub struct HostDeviceConfig {
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    /// Total bytes all live allocations may hold.
    pub memory_budget: u64,
    /// Extra time the queue takes before signaling a submission's fence.
    pub completion_delay: Duration,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        let host_visible =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        Self {
            memory_types: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                host_visible,
                vk::MemoryPropertyFlags::DEVICE_LOCAL | host_visible,
            ],
            memory_budget: 1 << 32,
            completion_delay: Duration::ZERO,
        }
    }
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, DeviceError> {
    mutex
        .lock()
        .map_err(|_| DeviceError::DeviceLost("host device state poisoned".into()))
}

struct HostAllocation {
    id: u64,
    size: u64,
    host_visible: bool,
    bytes: Mutex<Vec<u8>>,
}

#[derive(Clone)]
pub struct HostMemory(Arc<HostAllocation>);

impl HostMemory {
    pub fn size(&self) -> u64 {
        self.0.size
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>, DeviceError> {
        if offset + len > self.0.size {
            return Err(DeviceError::OutOfRange {
                offset,
                len,
                size: self.0.size,
            });
        }
        Ok(offset as usize..(offset + len) as usize)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let range = self.check_range(offset, data.len() as u64)?;
        lock(&self.0.bytes)?[range].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
        let range = self.check_range(offset, out.len() as u64)?;
        out.copy_from_slice(&lock(&self.0.bytes)?[range]);
        Ok(())
    }
}

impl PartialEq for HostBuffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for HostMemory {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("id", &self.0.id)
            .field("size", &self.0.size)
            .finish()
    }
}

struct HostBufferInner {
    id: u64,
    size: u64,
    usage: vk::BufferUsageFlags,
    binding: Mutex<Option<(HostMemory, u64)>>,
}

/// A buffer as the queue sees it. Stages and the engine access it directly,
/// host visibility only restricts `write_memory`/`read_memory`.
#[derive(Clone)]
pub struct HostBuffer(Arc<HostBufferInner>);

impl HostBuffer {
    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.0.usage
    }

    fn bound(&self) -> Result<(HostMemory, u64), DeviceError> {
        lock(&self.0.binding)?
            .clone()
            .ok_or(DeviceError::BufferNotBound)
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>, DeviceError> {
        let (memory, offset) = self.bound()?;
        let mut out = vec![0; self.0.size as usize];
        memory.read(offset, &mut out)?;
        Ok(out)
    }

    /// Reads as many whole `T` as fit in the buffer.
    pub fn read<T: Pod>(&self) -> Result<Vec<T>, DeviceError> {
        let count = self.0.size as usize / std::mem::size_of::<T>().max(1);
        let mut out = vec![T::zeroed(); count];
        let (memory, offset) = self.bound()?;
        memory.read(offset, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    pub fn write_at<T: Pod>(&self, byte_offset: u64, data: &[T]) -> Result<(), DeviceError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if byte_offset + bytes.len() as u64 > self.0.size {
            return Err(DeviceError::OutOfRange {
                offset: byte_offset,
                len: bytes.len() as u64,
                size: self.0.size,
            });
        }
        let (memory, offset) = self.bound()?;
        memory.write(offset + byte_offset, bytes)
    }

    pub fn fill_zero(&self) -> Result<(), DeviceError> {
        self.write_at(0, &vec![0u8; self.0.size as usize])
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.0.id)
            .field("size", &self.0.size)
            .finish()
    }
}

pub struct HostPipeline {
    shader: String,
    bindings: Vec<BindingDescriptor>,
    kernel: Kernel,
}

pub struct HostBindingPool {
    max_sets: u32,
    allocated: AtomicU32,
}

#[derive(Clone)]
pub struct HostBindingSet {
    buffers: Arc<[HostBuffer]>,
}

pub type HostOperation = Arc<dyn Fn() -> Result<(), DeviceError> + Send + Sync>;

#[derive(Clone)]
pub enum HostCommand {
    Dispatch {
        shader: String,
        kernel: Kernel,
        buffers: Arc<[HostBuffer]>,
        groups: [u32; 3],
    },
    Barrier {
        scope: BarrierScope,
        buffers: Vec<HostBuffer>,
    },
    Copy {
        src: HostBuffer,
        dst: HostBuffer,
        size: u64,
    },
    /// Work recorded by the intersection engine.
    Host {
        label: &'static str,
        operation: HostOperation,
    },
}

impl HostCommand {
    pub fn label(&self) -> String {
        match self {
            HostCommand::Dispatch { shader, .. } => format!("dispatch {}", shader),
            HostCommand::Barrier { scope, .. } => {
                let destination = if *scope == BarrierScope::COMPUTE_TO_TRANSFER {
                    "transfer"
                } else if *scope == BarrierScope::COMPUTE_TO_HOST {
                    "host"
                } else {
                    "compute"
                };
                format!("barrier compute>{}", destination)
            }
            HostCommand::Copy { .. } => "copy".to_string(),
            HostCommand::Host { label, .. } => label.to_string(),
        }
    }

    fn execute(&self) -> Result<(), DeviceError> {
        match self {
            HostCommand::Dispatch {
                kernel,
                buffers,
                groups,
                ..
            } => kernel(&KernelArgs {
                buffers: &buffers[..],
                groups: *groups,
            }),
            // The queue runs commands one after another, so every write is already visible
            HostCommand::Barrier { .. } => Ok(()),
            HostCommand::Copy { src, dst, size } => {
                let bytes = src.read_bytes()?;
                dst.write_at(0, &bytes[..*size as usize])
            }
            HostCommand::Host { operation, .. } => operation(),
        }
    }
}

#[derive(Default)]
pub struct HostCommands {
    commands: Vec<HostCommand>,
    ended: bool,
}

impl HostCommands {
    pub fn commands(&self) -> &[HostCommand] {
        &self.commands
    }

    pub fn labels(&self) -> Vec<String> {
        self.commands.iter().map(HostCommand::label).collect()
    }

    pub(crate) fn push_host(&mut self, label: &'static str, operation: HostOperation) {
        self.commands.push(HostCommand::Host { label, operation });
    }
}

#[derive(Clone)]
pub struct HostFence(Arc<(Mutex<bool>, Condvar)>);

impl HostFence {
    fn new(signaled: bool) -> Self {
        HostFence(Arc::new((Mutex::new(signaled), Condvar::new())))
    }

    fn signal(&self) {
        let (state, condvar) = &*self.0;
        if let Ok(mut signaled) = state.lock() {
            *signaled = true;
            condvar.notify_all();
        }
    }
}

enum QueueMessage {
    Submit {
        commands: Arc<[HostCommand]>,
        fence: Option<HostFence>,
    },
    Idle(flume::Sender<()>),
}

#[derive(Default)]
struct QueueState {
    completed: AtomicU64,
    lost: Mutex<Option<String>>,
}

/// An in-process stand-in for a GPU: memory is plain bytes and the queue is a
/// worker thread that runs recorded commands in submission order.
pub struct HostDevice {
    config: HostDeviceConfig,
    sender: Option<flume::Sender<QueueMessage>>,
    worker: Option<JoinHandle<()>>,
    queue: Arc<QueueState>,
    next_id: AtomicU64,
    allocated_bytes: AtomicU64,
    live_allocations: AtomicUsize,
    live_buffers: AtomicUsize,
    submitted: AtomicU64,
    reject_submissions: AtomicBool,
}

impl HostDevice {
    pub fn new(config: HostDeviceConfig) -> Self {
        let (sender, receiver) = flume::unbounded::<QueueMessage>();
        let queue = Arc::new(QueueState::default());

        let worker = {
            let queue = queue.clone();
            let completion_delay = config.completion_delay;
            std::thread::Builder::new()
                .name("host-queue".into())
                .spawn(move || run_queue(receiver, queue, completion_delay))
                .ok()
        };
        if worker.is_none() {
            log::error!("Could not spawn the host queue thread");
        }

        Self {
            config,
            sender: Some(sender),
            worker,
            queue,
            next_id: AtomicU64::new(1),
            allocated_bytes: AtomicU64::new(0),
            live_allocations: AtomicUsize::new(0),
            live_buffers: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            reject_submissions: AtomicBool::new(false),
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::SeqCst)
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Number of submissions the queue has finished executing.
    pub fn completed(&self) -> u64 {
        self.queue.completed.load(Ordering::SeqCst)
    }

    /// Makes the queue refuse submissions, as a lost surface or device would.
    pub fn set_reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, message: QueueMessage) -> Result<(), DeviceError> {
        self.sender
            .as_ref()
            .ok_or_else(|| DeviceError::DeviceLost("queue is shut down".into()))?
            .send(message)
            .map_err(|_| DeviceError::DeviceLost("queue thread exited".into()))
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        match &*lock(&self.queue.lost)? {
            Some(reason) => Err(DeviceError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn buffer_alignment(usage: vk::BufferUsageFlags) -> u64 {
        if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            256
        } else {
            16
        }
    }
}

fn run_queue(
    receiver: flume::Receiver<QueueMessage>,
    queue: Arc<QueueState>,
    completion_delay: Duration,
) {
    for message in receiver.iter() {
        match message {
            QueueMessage::Submit { commands, fence } => {
                for command in commands.iter() {
                    // A panicking kernel loses the device instead of the queue thread
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| command.execute()))
                        .unwrap_or_else(|payload| {
                            Err(DeviceError::DeviceLost(format!(
                                "kernel panicked: {}",
                                panic_message(&*payload)
                            )))
                        });
                    if let Err(err) = outcome {
                        log::error!("Host queue failed at {}: {}", command.label(), err);
                        if let Ok(mut lost) = queue.lost.lock() {
                            lost.get_or_insert_with(|| err.to_string());
                        }
                        break;
                    }
                }
                if !completion_delay.is_zero() {
                    std::thread::sleep(completion_delay);
                }
                queue.completed.fetch_add(1, Ordering::SeqCst);
                if let Some(fence) = fence {
                    fence.signal();
                }
            }
            QueueMessage::Idle(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ComputeDevice for HostDevice {
    type Memory = HostMemory;
    type Buffer = HostBuffer;
    type Pipeline = HostPipeline;
    type BindingPool = HostBindingPool;
    type BindingSet = HostBindingSet;
    type CommandSequence = HostCommands;
    type Fence = HostFence;

    fn memory_type_index(
        &self,
        requirements: &MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        find_memorytype_index(
            requirements.memory_type_bits,
            &self.config.memory_types,
            flags,
        )
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> Result<HostMemory, DeviceError> {
        let flags = *self
            .config
            .memory_types
            .get(memory_type_index as usize)
            .ok_or(DeviceError::InvalidMemoryType(memory_type_index))?;

        let previous = self.allocated_bytes.fetch_add(size, Ordering::SeqCst);
        if previous + size > self.config.memory_budget {
            self.allocated_bytes.fetch_sub(size, Ordering::SeqCst);
            return Err(DeviceError::OutOfMemory {
                requested: size,
                available: self.config.memory_budget.saturating_sub(previous),
            });
        }
        self.live_allocations.fetch_add(1, Ordering::SeqCst);

        Ok(HostMemory(Arc::new(HostAllocation {
            id: self.next_id(),
            size,
            host_visible: flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            bytes: Mutex::new(vec![0; size as usize]),
        })))
    }

    fn free_memory(&self, memory: HostMemory) {
        self.allocated_bytes.fetch_sub(memory.size(), Ordering::SeqCst);
        self.live_allocations.fetch_sub(1, Ordering::SeqCst);
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<HostBuffer, DeviceError> {
        self.live_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(HostBuffer(Arc::new(HostBufferInner {
            id: self.next_id(),
            size,
            usage,
            binding: Mutex::new(None),
        })))
    }

    fn buffer_requirements(&self, buffer: &HostBuffer) -> MemoryRequirements {
        let alignment = Self::buffer_alignment(buffer.usage());
        MemoryRequirements {
            size: crate::arena::align_up(buffer.size(), 4),
            alignment,
            memory_type_bits: (1u32 << self.config.memory_types.len()) - 1,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: &HostBuffer,
        memory: &HostMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), DeviceError> {
        memory.check_range(offset, buffer.size())?;
        *lock(&buffer.0.binding)? = Some((memory.clone(), offset));
        Ok(())
    }

    fn destroy_buffer(&self, _buffer: HostBuffer) {
        self.live_buffers.fetch_sub(1, Ordering::SeqCst);
    }

    fn write_memory(
        &self,
        memory: &HostMemory,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        if !memory.0.host_visible {
            return Err(DeviceError::NotHostVisible);
        }
        memory.write(offset, data)
    }

    fn read_memory(
        &self,
        memory: &HostMemory,
        offset: vk::DeviceSize,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        if !memory.0.host_visible {
            return Err(DeviceError::NotHostVisible);
        }
        memory.read(offset, out)
    }

    fn create_pipeline(
        &self,
        shader_name: &str,
        bindings: &[BindingDescriptor],
    ) -> Result<HostPipeline, DeviceError> {
        let (kernel, binding_count) = kernels::lookup(shader_name)
            .ok_or_else(|| DeviceError::ShaderNotFound(shader_name.to_string()))?;
        if bindings.len() != binding_count {
            return Err(DeviceError::BindingMismatch {
                expected: binding_count,
                actual: bindings.len(),
            });
        }
        Ok(HostPipeline {
            shader: shader_name.to_string(),
            bindings: bindings.to_vec(),
            kernel,
        })
    }

    fn destroy_pipeline(&self, _pipeline: HostPipeline) {}

    fn create_binding_pool(&self, max_sets: u32) -> Result<HostBindingPool, DeviceError> {
        Ok(HostBindingPool {
            max_sets,
            allocated: AtomicU32::new(0),
        })
    }

    fn reset_binding_pool(&self, pool: &HostBindingPool) -> Result<(), DeviceError> {
        pool.allocated.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn destroy_binding_pool(&self, _pool: HostBindingPool) {}

    fn allocate_binding_set(
        &self,
        pool: &HostBindingPool,
        pipeline: &HostPipeline,
        buffers: &[&HostBuffer],
    ) -> Result<HostBindingSet, DeviceError> {
        if buffers.len() != pipeline.bindings.len() {
            return Err(DeviceError::BindingMismatch {
                expected: pipeline.bindings.len(),
                actual: buffers.len(),
            });
        }
        if pool.allocated.fetch_add(1, Ordering::SeqCst) >= pool.max_sets {
            pool.allocated.fetch_sub(1, Ordering::SeqCst);
            return Err(DeviceError::PoolExhausted(pool.max_sets));
        }
        Ok(HostBindingSet {
            buffers: buffers.iter().map(|buffer| (*buffer).clone()).collect(),
        })
    }

    fn begin_commands(&self) -> Result<HostCommands, DeviceError> {
        Ok(HostCommands::default())
    }

    fn cmd_dispatch(
        &self,
        commands: &mut HostCommands,
        pipeline: &HostPipeline,
        binding_set: &HostBindingSet,
        groups: [u32; 3],
    ) {
        commands.commands.push(HostCommand::Dispatch {
            shader: pipeline.shader.clone(),
            kernel: pipeline.kernel,
            buffers: binding_set.buffers.clone(),
            groups,
        });
    }

    fn cmd_buffer_barrier(
        &self,
        commands: &mut HostCommands,
        scope: BarrierScope,
        buffers: &[&HostBuffer],
    ) {
        commands.commands.push(HostCommand::Barrier {
            scope,
            buffers: buffers.iter().map(|buffer| (*buffer).clone()).collect(),
        });
    }

    fn cmd_copy_buffer(
        &self,
        commands: &mut HostCommands,
        src: &HostBuffer,
        dst: &HostBuffer,
        size: vk::DeviceSize,
    ) {
        commands.commands.push(HostCommand::Copy {
            src: src.clone(),
            dst: dst.clone(),
            size,
        });
    }

    fn end_commands(&self, commands: &mut HostCommands) -> Result<(), DeviceError> {
        commands.ended = true;
        Ok(())
    }

    fn free_commands(&self, _commands: HostCommands) {}

    fn submit(
        &self,
        commands: &HostCommands,
        fence: Option<&HostFence>,
    ) -> Result<(), DeviceError> {
        self.check_lost()?;
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(DeviceError::SubmitRejected);
        }
        if !commands.ended {
            return Err(DeviceError::CommandsNotEnded);
        }
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.send(QueueMessage::Submit {
            commands: commands.commands.iter().cloned().collect(),
            fence: fence.cloned(),
        })
    }

    fn create_fence(&self, signaled: bool) -> Result<HostFence, DeviceError> {
        Ok(HostFence::new(signaled))
    }

    fn fence_status(&self, fence: &HostFence) -> Result<bool, DeviceError> {
        Ok(*lock(&fence.0 .0)?)
    }

    fn wait_fence(&self, fence: &HostFence, timeout: Duration) -> Result<bool, DeviceError> {
        let (state, condvar) = &*fence.0;
        let guard = lock(state)?;
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .map_err(|_| DeviceError::DeviceLost("host fence poisoned".into()))?;
        let signaled = *guard;
        drop(guard);
        if signaled {
            self.check_lost()?;
        } else if self.worker.as_ref().map_or(true, JoinHandle::is_finished) {
            // Nothing is left to signal the fence
            self.check_lost()?;
            return Err(DeviceError::DeviceLost("queue thread exited".into()));
        }
        Ok(signaled)
    }

    fn reset_fence(&self, fence: &HostFence) -> Result<(), DeviceError> {
        *lock(&fence.0 .0)? = false;
        Ok(())
    }

    fn destroy_fence(&self, _fence: HostFence) {}

    fn wait_idle(&self) -> Result<(), DeviceError> {
        let (reply, done) = flume::bounded(1);
        self.send(QueueMessage::Idle(reply))?;
        done.recv()
            .map_err(|_| DeviceError::DeviceLost("queue thread exited".into()))?;
        self.check_lost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn fence_is_signaled_after_delayed_completion() {
        let device = HostDevice::new(HostDeviceConfig {
            completion_delay: Duration::from_millis(50),
            ..HostDeviceConfig::default()
        });
        let mut commands = device.begin_commands().unwrap();
        device.end_commands(&mut commands).unwrap();
        let fence = device.create_fence(false).unwrap();

        let start = Instant::now();
        device.submit(&commands, Some(&fence)).unwrap();
        assert!(!device.fence_status(&fence).unwrap());
        while !device.wait_fence(&fence, Duration::from_millis(10)).unwrap() {}

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(device.completed(), 1);
    }

    #[test]
    fn panicking_command_loses_the_device() {
        let device = HostDevice::new(HostDeviceConfig::default());
        let mut commands = device.begin_commands().unwrap();
        commands.push_host(
            "explode",
            Arc::new(|| -> Result<(), DeviceError> { panic!("kernel bug") }),
        );
        device.end_commands(&mut commands).unwrap();
        let fence = device.create_fence(false).unwrap();

        device.submit(&commands, Some(&fence)).unwrap();
        assert!(matches!(
            device.wait_fence(&fence, Duration::from_secs(5)),
            Err(DeviceError::DeviceLost(_))
        ));
        assert!(matches!(
            device.submit(&commands, None),
            Err(DeviceError::DeviceLost(_))
        ));
        // the queue thread survived and still answers
        assert!(device.wait_idle().is_err());
        assert_eq!(device.completed(), 1);
    }

    #[test]
    fn unended_commands_are_rejected() {
        let device = HostDevice::new(HostDeviceConfig::default());
        let commands = device.begin_commands().unwrap();
        assert!(matches!(
            device.submit(&commands, None),
            Err(DeviceError::CommandsNotEnded)
        ));
    }

    #[test]
    fn device_local_memory_is_not_mappable() {
        let device = HostDevice::new(HostDeviceConfig::default());
        let memory = device.allocate_memory(64, 0).unwrap();
        assert!(matches!(
            device.write_memory(&memory, 0, &[1, 2, 3]),
            Err(DeviceError::NotHostVisible)
        ));
        let visible = device.allocate_memory(64, 1).unwrap();
        assert!(matches!(
            device.write_memory(&visible, 62, &[1, 2, 3]),
            Err(DeviceError::OutOfRange { .. })
        ));
        device.free_memory(memory);
        device.free_memory(visible);
    }

    #[test]
    fn copy_runs_on_the_queue() {
        let device = HostDevice::new(HostDeviceConfig::default());
        let memory = device.allocate_memory(64, 1).unwrap();
        let src = device
            .create_buffer(16, vk::BufferUsageFlags::TRANSFER_SRC)
            .unwrap();
        let dst = device
            .create_buffer(16, vk::BufferUsageFlags::TRANSFER_DST)
            .unwrap();
        device.bind_buffer_memory(&src, &memory, 0).unwrap();
        device.bind_buffer_memory(&dst, &memory, 32).unwrap();
        device.write_memory(&memory, 0, &[9u8; 16]).unwrap();

        let mut commands = device.begin_commands().unwrap();
        device.cmd_copy_buffer(&mut commands, &src, &dst, 16);
        device.end_commands(&mut commands).unwrap();
        device.submit_and_wait(&commands).unwrap();

        let mut out = [0u8; 16];
        device.read_memory(&memory, 32, &mut out).unwrap();
        assert_eq!(out, [9u8; 16]);
    }
}
