// Frame scheduling protocol
//
// One iteration of the steady-state loop, expressed against the narrow
// `FrameDriver` seam so the ordering rules (fence wait before reset, no
// index advance on a skipped iteration, stale-chain handoff) can be
// exercised without a GPU. The concrete renderer implements the driver
// over ash; tests implement it with a recording mock.

/// Result of asking the swapchain for the next presentable image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of queueing a presentation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented { suboptimal: bool },
    OutOfDate,
}

/// What a single loop iteration did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Rendered { image_index: u32 },
    /// The chain went stale during acquire; nothing was submitted, the
    /// slot fence was not reset, and the frame index did not advance.
    SkippedStale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChainState {
    Valid,
    Stale,
}

/// The per-iteration GPU operations the scheduler sequences. `slot` is the
/// frame-in-flight slot index, `image_index` the acquired swapchain image.
pub trait FrameDriver {
    type Error;

    /// Block until the slot's previous submission has completed.
    fn wait_slot_fence(&mut self, slot: usize) -> Result<(), Self::Error>;
    /// Acquire the next image, signaling the slot's image-available semaphore.
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome, Self::Error>;
    /// Write the acquired image's uniform buffer for this frame.
    fn write_uniforms(&mut self, image_index: u32) -> Result<(), Self::Error>;
    /// Unsignal the slot's fence ahead of the submission that will signal it.
    fn reset_slot_fence(&mut self, slot: usize) -> Result<(), Self::Error>;
    /// Submit the image's pre-recorded command buffer, waiting on
    /// image-available and signaling render-finished plus the slot fence.
    fn submit(&mut self, slot: usize, image_index: u32) -> Result<(), Self::Error>;
    /// Present the image, waiting on render-finished.
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome, Self::Error>;
}

/// Owns the frame-in-flight index and the chain validity state.
///
/// The scheduler never touches GPU handles itself; it decides what happens
/// next and in which order. Recreation is the caller's job: when
/// [`FrameScheduler::needs_rebuild`] turns true, rebuild the chain and the
/// format-dependent objects, then call [`FrameScheduler::rebuilt`].
#[derive(Clone, Copy, Debug)]
pub struct FrameScheduler {
    frame_index: usize,
    frames_in_flight: usize,
    chain: ChainState,
    resize_requested: bool,
}

impl FrameScheduler {
    pub fn new(frames_in_flight: usize) -> Self {
        assert!(frames_in_flight > 0);
        Self {
            frame_index: 0,
            frames_in_flight,
            chain: ChainState::Valid,
            resize_requested: false,
        }
    }

    /// Slot that the next iteration will use.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Record an externally observed resize; consumed at the next present.
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    /// True while the chain is stale and must be rebuilt before rendering.
    pub fn needs_rebuild(&self) -> bool {
        self.chain == ChainState::Stale
    }

    /// The caller finished rebuilding the chain and its dependents. The
    /// rebuild used the latest framebuffer size, so any pending resize
    /// request is consumed along with it.
    pub fn rebuilt(&mut self) {
        self.chain = ChainState::Valid;
        self.resize_requested = false;
    }

    /// Drive one iteration of the steady-state protocol.
    ///
    /// Must not be called while [`needs_rebuild`](Self::needs_rebuild) is
    /// true; a stale chain cannot acquire.
    pub fn run_frame<D: FrameDriver>(
        &mut self,
        driver: &mut D,
    ) -> Result<FrameOutcome, D::Error> {
        debug_assert_eq!(self.chain, ChainState::Valid);
        let slot = self.frame_index;

        driver.wait_slot_fence(slot)?;

        let image_index = match driver.acquire_image(slot)? {
            AcquireOutcome::OutOfDate => {
                // Skip the rest of the iteration: no fence reset, no
                // submission, no index advance.
                self.chain = ChainState::Stale;
                return Ok(FrameOutcome::SkippedStale);
            }
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    self.resize_requested = true;
                }
                image_index
            }
        };

        driver.write_uniforms(image_index)?;

        driver.reset_slot_fence(slot)?;
        driver.submit(slot, image_index)?;

        let stale = match driver.present(slot, image_index)? {
            PresentOutcome::OutOfDate => true,
            PresentOutcome::Presented { suboptimal } => suboptimal || self.resize_requested,
        };
        if stale {
            self.chain = ChainState::Stale;
            self.resize_requested = false;
        }

        self.frame_index = (self.frame_index + 1) % self.frames_in_flight;
        Ok(FrameOutcome::Rendered { image_index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Event {
        WaitFence(usize),
        Acquire(usize),
        WriteUniforms(u32),
        ResetFence(usize),
        Submit { slot: usize, image: u32 },
        Present { slot: usize, image: u32 },
    }

    /// Round-robin swapchain with a scriptable fault queue.
    struct MockDriver {
        image_count: u32,
        next_image: u32,
        events: Vec<Event>,
        acquire_faults: Vec<AcquireOutcome>,
        present_faults: Vec<PresentOutcome>,
    }

    impl MockDriver {
        fn new(image_count: u32) -> Self {
            Self {
                image_count,
                next_image: 0,
                events: Vec::new(),
                acquire_faults: Vec::new(),
                present_faults: Vec::new(),
            }
        }

        fn submissions_for(&self, image: u32) -> usize {
            self.events
                .iter()
                .filter(|e| matches!(e, Event::Submit { image: i, .. } if *i == image))
                .count()
        }
    }

    impl FrameDriver for MockDriver {
        type Error = ();

        fn wait_slot_fence(&mut self, slot: usize) -> Result<(), ()> {
            self.events.push(Event::WaitFence(slot));
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome, ()> {
            self.events.push(Event::Acquire(slot));
            if let Some(fault) = self.acquire_faults.pop() {
                return Ok(fault);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal: false,
            })
        }

        fn write_uniforms(&mut self, image_index: u32) -> Result<(), ()> {
            self.events.push(Event::WriteUniforms(image_index));
            Ok(())
        }

        fn reset_slot_fence(&mut self, slot: usize) -> Result<(), ()> {
            self.events.push(Event::ResetFence(slot));
            Ok(())
        }

        fn submit(&mut self, slot: usize, image: u32) -> Result<(), ()> {
            self.events.push(Event::Submit { slot, image });
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> Result<PresentOutcome, ()> {
            self.events.push(Event::Present { slot, image });
            Ok(self.present_faults.pop().unwrap_or(PresentOutcome::Presented {
                suboptimal: false,
            }))
        }
    }

    /// Ledger of chain-dependent handles across recreations: every handle
    /// gets a unique id, and destruction is recorded per id.
    struct MockChain {
        generation: u64,
        image_count: usize,
        live: Vec<usize>,
        destroyed: Vec<usize>,
        next_handle: usize,
        recreations: usize,
    }

    impl MockChain {
        fn new(image_count: usize) -> Self {
            let mut chain = Self {
                generation: 0,
                image_count,
                live: Vec::new(),
                destroyed: Vec::new(),
                next_handle: 0,
                recreations: 0,
            };
            chain.allocate_handles();
            chain
        }

        // One view, framebuffer, and command buffer per image.
        fn allocate_handles(&mut self) {
            for _ in 0..self.image_count * 3 {
                self.live.push(self.next_handle);
                self.next_handle += 1;
            }
        }

        fn recreate(&mut self) {
            for handle in self.live.drain(..) {
                self.destroyed.push(handle);
            }
            self.generation += 1;
            self.recreations += 1;
            self.allocate_handles();
        }

        fn destructions_of(&self, handle: usize) -> usize {
            self.destroyed.iter().filter(|&&d| d == handle).count()
        }
    }

    #[test]
    fn frame_index_cycles_modulo_frames_in_flight() {
        let mut driver = MockDriver::new(3);
        let mut scheduler = FrameScheduler::new(2);

        let mut observed = Vec::new();
        for _ in 0..5 {
            let outcome = scheduler.run_frame(&mut driver).unwrap();
            assert!(matches!(outcome, FrameOutcome::Rendered { .. }));
            observed.push(scheduler.frame_index());
        }
        // Post-advance values for 5 completed frames starting at slot 0.
        assert_eq!(observed, vec![1, 0, 1, 0, 1]);
    }

    #[test]
    fn three_images_two_slots_five_frames_submission_shares() {
        let mut driver = MockDriver::new(3);
        let mut scheduler = FrameScheduler::new(2);

        for _ in 0..5 {
            scheduler.run_frame(&mut driver).unwrap();
        }
        // Acquire order is 0,1,2,0,1: images 0 and 1 are submitted twice,
        // image 2 once.
        assert_eq!(driver.submissions_for(0), 2);
        assert_eq!(driver.submissions_for(1), 2);
        assert_eq!(driver.submissions_for(2), 1);
    }

    #[test]
    fn every_fence_reset_is_preceded_by_a_wait_on_the_same_slot() {
        let mut driver = MockDriver::new(3);
        let mut scheduler = FrameScheduler::new(2);
        for _ in 0..6 {
            scheduler.run_frame(&mut driver).unwrap();
        }

        let mut last_wait: [Option<usize>; 2] = [None, None];
        for (position, event) in driver.events.iter().enumerate() {
            match *event {
                Event::WaitFence(slot) => last_wait[slot] = Some(position),
                Event::ResetFence(slot) => {
                    let waited = last_wait[slot].take();
                    assert!(waited.is_some(), "fence {slot} reset without a prior wait");
                }
                _ => {}
            }
        }
    }

    #[test]
    fn out_of_date_acquire_skips_without_advancing_or_resetting() {
        let mut driver = MockDriver::new(3);
        driver.acquire_faults.push(AcquireOutcome::OutOfDate);
        let mut scheduler = FrameScheduler::new(2);

        let outcome = scheduler.run_frame(&mut driver).unwrap();
        assert_eq!(outcome, FrameOutcome::SkippedStale);
        assert_eq!(scheduler.frame_index(), 0);
        assert!(scheduler.needs_rebuild());
        assert_eq!(
            driver.events,
            vec![Event::WaitFence(0), Event::Acquire(0)],
            "no uniforms, fence reset, submit, or present on a skipped frame"
        );

        // After the rebuild the same slot runs to completion.
        scheduler.rebuilt();
        let outcome = scheduler.run_frame(&mut driver).unwrap();
        assert_eq!(outcome, FrameOutcome::Rendered { image_index: 0 });
        assert_eq!(scheduler.frame_index(), 1);
    }

    #[test]
    fn out_of_date_present_marks_chain_stale_but_advances() {
        let mut driver = MockDriver::new(2);
        driver.present_faults.push(PresentOutcome::OutOfDate);
        let mut scheduler = FrameScheduler::new(2);

        let outcome = scheduler.run_frame(&mut driver).unwrap();
        assert!(matches!(outcome, FrameOutcome::Rendered { .. }));
        assert!(scheduler.needs_rebuild());
        assert_eq!(scheduler.frame_index(), 1);
    }

    #[test]
    fn resize_flag_triggers_exactly_one_rebuild_cycle() {
        let mut driver = MockDriver::new(3);
        let mut scheduler = FrameScheduler::new(2);

        scheduler.request_resize();
        scheduler.run_frame(&mut driver).unwrap();
        assert!(scheduler.needs_rebuild(), "resize flag consumed at present");

        scheduler.rebuilt();
        // Flag was cleared alongside the stale transition: the next frames
        // do not ask for another rebuild.
        for _ in 0..3 {
            scheduler.run_frame(&mut driver).unwrap();
            assert!(!scheduler.needs_rebuild());
        }
    }

    #[test]
    fn resize_rebuild_bumps_generation_once_and_frees_every_old_handle() {
        let mut driver = MockDriver::new(3);
        let mut chain = MockChain::new(3);
        let mut scheduler = FrameScheduler::new(2);

        let old_handles = chain.live.clone();
        scheduler.request_resize();

        // The caller-side loop: rebuild when asked, then render.
        for _ in 0..6 {
            if scheduler.needs_rebuild() {
                chain.recreate();
                scheduler.rebuilt();
            }
            scheduler.run_frame(&mut driver).unwrap();
        }

        assert_eq!(chain.recreations, 1);
        assert_eq!(chain.generation, 1);
        for &handle in &old_handles {
            assert_eq!(
                chain.destructions_of(handle),
                1,
                "pre-recreation handle {handle} must be destroyed exactly once"
            );
        }
        // Only the replacement handles survive.
        assert_eq!(chain.live.len(), old_handles.len());
        assert!(chain.live.iter().all(|h| !old_handles.contains(h)));
    }

    #[test]
    fn rebuild_consumes_a_pending_resize_request() {
        let mut driver = MockDriver::new(3);
        driver.acquire_faults.push(AcquireOutcome::OutOfDate);
        let mut scheduler = FrameScheduler::new(2);

        // A resize arrives, then the chain goes stale at acquire before the
        // flag reaches a present.
        scheduler.request_resize();
        let outcome = scheduler.run_frame(&mut driver).unwrap();
        assert_eq!(outcome, FrameOutcome::SkippedStale);
        assert!(scheduler.needs_rebuild());

        scheduler.rebuilt();
        // The rebuild already used the latest framebuffer size; the leftover
        // request must not force a second recreation.
        for _ in 0..3 {
            scheduler.run_frame(&mut driver).unwrap();
            assert!(!scheduler.needs_rebuild());
        }
    }

    #[test]
    fn suboptimal_acquire_defers_rebuild_to_the_present_step() {
        let mut driver = MockDriver::new(2);
        driver.acquire_faults.push(AcquireOutcome::Ready {
            image_index: 0,
            suboptimal: true,
        });
        let mut scheduler = FrameScheduler::new(2);

        scheduler.run_frame(&mut driver).unwrap();
        // The frame still rendered, and the suboptimal signal became a
        // stale transition at present time.
        assert!(scheduler.needs_rebuild());
        assert_eq!(driver.submissions_for(0), 1);
    }
}
