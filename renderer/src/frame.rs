use ash::vk::ImageLayout;
use log::trace;

use crate::Result;

/// State of the film or a back buffer between commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    UnorderedAccess,
    CopySource,
    CopyDest,
    Present,
}

impl ResourceState {
    pub fn layout(self) -> ImageLayout {
        match self {
            ResourceState::UnorderedAccess => ImageLayout::GENERAL,
            ResourceState::CopySource => ImageLayout::TRANSFER_SRC_OPTIMAL,
            ResourceState::CopyDest => ImageLayout::TRANSFER_DST_OPTIMAL,
            ResourceState::Present => ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

/// Progressive sample counter bounded by a maximum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleState {
    index: u32,
    max: u32,
}

impl SampleState {
    pub fn new(max: u32) -> Self {
        Self { index: 0, max }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.max
    }

    /// Index of the sample to dispatch, or `None` once the budget is spent.
    pub fn advance(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        let index = self.index;
        self.index += 1;
        Some(index)
    }
}

/// Commands the orchestrator issues. Recording methods act on the command list opened by
/// the last `begin_frame`.
pub trait FrameBackend {
    /// Back buffer index to render frame slot `slot` into.
    fn acquire(&mut self, slot: usize) -> Result<u32>;
    /// Resets the allocator of `slot` and opens its command list.
    fn begin_frame(&mut self, slot: usize) -> Result<()>;
    fn bind_global_arguments(&mut self, sample_index: u32);
    fn dispatch_rays(&mut self, width: u32, height: u32);
    fn transition_film(&mut self, from: ResourceState, to: ResourceState);
    fn transition_back_buffer(&mut self, image: u32, from: ResourceState, to: ResourceState);
    fn copy_film_to_back_buffer(&mut self, image: u32);
    /// Closes and executes the open command list.
    fn submit(&mut self, image: u32) -> Result<()>;
    fn present(&mut self, image: u32) -> Result<()>;
    fn signal(&mut self, value: u64) -> Result<()>;
    fn completed_fence_value(&self) -> Result<u64>;
    /// Blocks until the fence reaches `value`.
    fn wait_for_fence(&mut self, value: u64) -> Result<()>;
}

/// Per back buffer slot bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    /// The slot's resources are free once the fence reaches this value.
    pub fence_wait_value: u64,
}

/// Double-buffered render loop: one dispatch per frame until the sample budget is spent,
/// then presentation of the accumulated film only.
pub struct FrameOrchestrator<B: FrameBackend> {
    backend: B,
    frames: Vec<Frame>,
    current: usize,
    fence_value: u64,
    samples: SampleState,
    width: u32,
    height: u32,
}

impl<B: FrameBackend> FrameOrchestrator<B> {
    pub fn new(backend: B, frame_count: usize, width: u32, height: u32, max_samples: u32) -> Self {
        Self {
            backend,
            frames: vec![Frame::default(); frame_count.max(1)],
            current: 0,
            fence_value: 0,
            samples: SampleState::new(max_samples),
            width,
            height,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn current_frame(&self) -> usize {
        self.current
    }

    /// Number of samples dispatched so far.
    pub fn sample_index(&self) -> u32 {
        self.samples.index()
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    /// Records, submits and presents one frame. Returns whether rays were dispatched.
    pub fn render(&mut self) -> Result<bool> {
        let slot = self.current;
        let wait_value = self.frames[slot].fence_wait_value;
        if self.backend.completed_fence_value()? < wait_value {
            trace!("frame {} waits for fence value {}", slot, wait_value);
            self.backend.wait_for_fence(wait_value)?;
        }

        let image = self.backend.acquire(slot)?;
        self.backend.begin_frame(slot)?;

        self.backend.bind_global_arguments(self.samples.index());
        let dispatched = match self.samples.advance() {
            Some(sample) => {
                trace!("frame {} dispatches sample {}", slot, sample);
                self.backend.dispatch_rays(self.width, self.height);
                true
            }
            None => false,
        };

        self.backend
            .transition_film(ResourceState::UnorderedAccess, ResourceState::CopySource);
        self.backend
            .transition_back_buffer(image, ResourceState::Present, ResourceState::CopyDest);
        self.backend.copy_film_to_back_buffer(image);
        self.backend
            .transition_back_buffer(image, ResourceState::CopyDest, ResourceState::Present);
        self.backend
            .transition_film(ResourceState::CopySource, ResourceState::UnorderedAccess);

        self.backend.submit(image)?;
        self.backend.present(image)?;

        self.fence_value += 1;
        self.backend.signal(self.fence_value)?;
        self.frames[slot].fence_wait_value = self.fence_value;

        self.current = (self.current + 1) % self.frames.len();
        Ok(dispatched)
    }

    /// Signals the next fence value and blocks until the device reaches it.
    pub fn wait_for_gpu(&mut self) -> Result<u64> {
        self.fence_value += 1;
        self.backend.signal(self.fence_value)?;
        self.backend.wait_for_fence(self.fence_value)?;
        Ok(self.fence_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SAMPLES;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Acquire(usize),
        Begin(usize),
        Bind(u32),
        Dispatch(u32, u32),
        Film(ResourceState, ResourceState),
        BackBuffer(u32, ResourceState, ResourceState),
        Copy(u32),
        Submit(u32),
        Present(u32),
        Signal(u64),
        Wait(u64),
    }

    /// Records every call. The device completes work only when waited on, unless
    /// `instant` is set.
    #[derive(Default)]
    struct RecordingBackend {
        calls: Vec<Call>,
        image_count: u32,
        next_image: u32,
        signaled: u64,
        completed: u64,
        instant: bool,
    }

    impl RecordingBackend {
        fn new(image_count: u32, instant: bool) -> Self {
            Self {
                image_count,
                instant,
                ..Default::default()
            }
        }

        fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|call| f(call)).count()
        }

        fn drain(&mut self) -> Vec<Call> {
            std::mem::take(&mut self.calls)
        }
    }

    impl FrameBackend for RecordingBackend {
        fn acquire(&mut self, slot: usize) -> Result<u32> {
            self.calls.push(Call::Acquire(slot));
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(image)
        }

        fn begin_frame(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Begin(slot));
            Ok(())
        }

        fn bind_global_arguments(&mut self, sample_index: u32) {
            self.calls.push(Call::Bind(sample_index));
        }

        fn dispatch_rays(&mut self, width: u32, height: u32) {
            self.calls.push(Call::Dispatch(width, height));
        }

        fn transition_film(&mut self, from: ResourceState, to: ResourceState) {
            self.calls.push(Call::Film(from, to));
        }

        fn transition_back_buffer(&mut self, image: u32, from: ResourceState, to: ResourceState) {
            self.calls.push(Call::BackBuffer(image, from, to));
        }

        fn copy_film_to_back_buffer(&mut self, image: u32) {
            self.calls.push(Call::Copy(image));
        }

        fn submit(&mut self, image: u32) -> Result<()> {
            self.calls.push(Call::Submit(image));
            Ok(())
        }

        fn present(&mut self, image: u32) -> Result<()> {
            self.calls.push(Call::Present(image));
            Ok(())
        }

        fn signal(&mut self, value: u64) -> Result<()> {
            assert!(value > self.signaled, "fence values must increase");
            self.signaled = value;
            if self.instant {
                self.completed = value;
            }
            self.calls.push(Call::Signal(value));
            Ok(())
        }

        fn completed_fence_value(&self) -> Result<u64> {
            Ok(self.completed)
        }

        fn wait_for_fence(&mut self, value: u64) -> Result<()> {
            assert!(value <= self.signaled, "waiting on a value never signaled");
            self.completed = self.completed.max(value);
            self.calls.push(Call::Wait(value));
            Ok(())
        }
    }

    fn orchestrator(max_samples: u32, instant: bool) -> FrameOrchestrator<RecordingBackend> {
        FrameOrchestrator::new(RecordingBackend::new(2, instant), 2, 8, 4, max_samples)
    }

    #[test]
    fn first_frame_records_the_full_sequence() {
        let mut frames = orchestrator(4, true);
        assert!(frames.render().unwrap());
        use ResourceState::*;
        assert_eq!(
            frames.backend_mut().drain(),
            vec![
                Call::Acquire(0),
                Call::Begin(0),
                Call::Bind(0),
                Call::Dispatch(8, 4),
                Call::Film(UnorderedAccess, CopySource),
                Call::BackBuffer(0, Present, CopyDest),
                Call::Copy(0),
                Call::BackBuffer(0, CopyDest, Present),
                Call::Film(CopySource, UnorderedAccess),
                Call::Submit(0),
                Call::Present(0),
                Call::Signal(1),
            ]
        );
        assert_eq!(frames.frames()[0].fence_wait_value, 1);
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn sample_budget_stops_dispatches_but_not_presentation() {
        let mut frames = orchestrator(MAX_SAMPLES, true);
        for _ in 0..MAX_SAMPLES {
            assert!(frames.render().unwrap());
        }
        let backend = frames.backend_mut();
        assert_eq!(
            backend.count(|call| matches!(call, Call::Dispatch(..))),
            MAX_SAMPLES as usize
        );
        backend.drain();

        assert!(!frames.render().unwrap());
        let backend = frames.backend();
        assert_eq!(backend.count(|call| matches!(call, Call::Dispatch(..))), 0);
        assert_eq!(backend.count(|call| matches!(call, Call::Copy(_))), 1);
        assert_eq!(backend.count(|call| matches!(call, Call::Present(_))), 1);
        assert_eq!(frames.sample_index(), MAX_SAMPLES);
    }

    #[test]
    fn sample_index_advances_once_per_dispatch() {
        let mut frames = orchestrator(3, true);
        for _ in 0..5 {
            frames.render().unwrap();
        }
        let binds: Vec<u32> = frames
            .backend()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Bind(sample) => Some(*sample),
                _ => None,
            })
            .collect();
        assert_eq!(binds, vec![0, 1, 2, 3, 3]);
    }

    #[test]
    fn film_round_trips_once_per_frame() {
        let mut frames = orchestrator(4, true);
        frames.render().unwrap();
        let film: Vec<Call> = frames
            .backend()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Film(..)))
            .cloned()
            .collect();
        assert_eq!(
            film,
            vec![
                Call::Film(ResourceState::UnorderedAccess, ResourceState::CopySource),
                Call::Film(ResourceState::CopySource, ResourceState::UnorderedAccess),
            ]
        );
    }

    #[test]
    fn slot_reuse_waits_for_its_previous_submission() {
        let mut frames = orchestrator(16, false);
        frames.render().unwrap();
        frames.render().unwrap();
        assert_eq!(
            frames.backend().count(|call| matches!(call, Call::Wait(_))),
            0
        );
        frames.backend_mut().drain();

        frames.render().unwrap();
        let calls = frames.backend_mut().drain();
        assert_eq!(calls[0], Call::Wait(1));
        assert_eq!(calls[1], Call::Acquire(0));

        frames.render().unwrap();
        assert_eq!(frames.backend_mut().drain()[0], Call::Wait(2));
    }

    #[test]
    fn completed_slots_are_not_waited_on() {
        let mut frames = orchestrator(16, true);
        for _ in 0..6 {
            frames.render().unwrap();
        }
        assert_eq!(
            frames.backend().count(|call| matches!(call, Call::Wait(_))),
            0
        );
    }

    #[test]
    fn wait_for_gpu_is_monotonic() {
        let mut frames = orchestrator(16, false);
        frames.render().unwrap();
        let first = frames.wait_for_gpu().unwrap();
        assert!(frames.backend().completed_fence_value().unwrap() >= first);
        frames.render().unwrap();
        let second = frames.wait_for_gpu().unwrap();
        assert!(second > first);
        assert!(frames.backend().completed_fence_value().unwrap() >= second);
    }

    #[test]
    fn sample_state_is_bounded() {
        let mut samples = SampleState::new(2);
        assert_eq!(samples.advance(), Some(0));
        assert_eq!(samples.advance(), Some(1));
        assert!(samples.is_exhausted());
        assert_eq!(samples.advance(), None);
        assert_eq!(samples.index(), 2);
    }

    #[test]
    fn states_map_to_image_layouts() {
        assert_eq!(ResourceState::UnorderedAccess.layout(), ImageLayout::GENERAL);
        assert_eq!(
            ResourceState::CopySource.layout(),
            ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(ResourceState::Present.layout(), ImageLayout::PRESENT_SRC_KHR);
    }
}
