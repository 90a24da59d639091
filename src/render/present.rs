//! Acquire, submit and present state machine
//!
//! A swapchain that went out of date is not an error here. It moves the
//! loop into [`PresentState::Invalidated`], and the next step rebuilds the
//! target exactly once before presentation resumes.

use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PresentState {
    #[default]
    Idle,
    Acquiring,
    Submitting,
    Presenting,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { index: u32, suboptimal: bool },
    /// Timed out or not ready yet
    NotReady,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Result of one call to [`PresentationLoop::run_cycle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// No image was available within the timeout
    Retry,
    /// The target was rebuilt and nothing was presented
    Recovered,
    /// Rebuilding had to wait, e.g. for a minimized surface
    Deferred,
}

/// What the loop drives. Implemented by the pipelines and by test fakes.
pub trait FrameTarget {
    fn acquire(&mut self, timeout: Duration) -> Result<AcquireOutcome>;

    /// Submit the recorded buffer for `image_index`, waiting on the
    /// acquire semaphore and signalling the release semaphore and fence.
    fn submit(&mut self, image_index: u32) -> Result<()>;

    fn present(&mut self, image_index: u32) -> Result<PresentOutcome>;

    /// Wait for the device, recreate the swapchain and re-record. Returns
    /// false when recreation had to be deferred.
    fn rebuild(&mut self) -> Result<bool>;
}

#[derive(Debug)]
pub struct PresentationLoop {
    state: PresentState,
    timeout: Duration,
    recoveries: u64,
    frames: u64,
}

impl PresentationLoop {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: PresentState::Idle,
            timeout,
            recoveries: 0,
            frames: 0,
        }
    }

    pub fn state(&self) -> PresentState {
        self.state
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    /// Force a rebuild before the next frame
    pub fn invalidate(&mut self) {
        self.state = PresentState::Invalidated;
    }

    pub fn run_cycle<T: FrameTarget>(&mut self, target: &mut T) -> Result<FrameStatus> {
        if self.state == PresentState::Invalidated {
            return self.recover(target);
        }

        self.state = PresentState::Acquiring;
        let (index, acquired_suboptimal) = match self.step(target.acquire(self.timeout))? {
            AcquireOutcome::Ready { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::NotReady => {
                self.state = PresentState::Idle;
                return Ok(FrameStatus::Retry);
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("swapchain out of date on acquire");
                self.state = PresentState::Invalidated;
                return self.recover(target);
            }
        };

        self.state = PresentState::Submitting;
        self.step(target.submit(index))?;

        self.state = PresentState::Presenting;
        match self.step(target.present(index))? {
            PresentOutcome::OutOfDate => {
                log::debug!("swapchain out of date on present");
                self.state = PresentState::Invalidated;
                self.recover(target)
            }
            outcome => {
                self.frames += 1;
                self.state = if acquired_suboptimal || outcome == PresentOutcome::Suboptimal {
                    log::debug!("swapchain suboptimal, rebuilding before the next frame");
                    PresentState::Invalidated
                } else {
                    PresentState::Idle
                };
                Ok(FrameStatus::Presented)
            }
        }
    }

    /// Errors leave the loop idle so a caller may retry the whole cycle
    fn step<V>(&mut self, result: Result<V>) -> Result<V> {
        if result.is_err() {
            self.state = PresentState::Idle;
        }
        result
    }

    fn recover<T: FrameTarget>(&mut self, target: &mut T) -> Result<FrameStatus> {
        if target.rebuild()? {
            self.recoveries += 1;
            self.state = PresentState::Idle;
            Ok(FrameStatus::Recovered)
        } else {
            Ok(FrameStatus::Deferred)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, GpuError};
    use ash::vk;
    use std::collections::VecDeque;

    /// Scripted target. Unscripted calls succeed.
    #[derive(Default)]
    struct FakeTarget {
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        rebuilds: VecDeque<bool>,
        fail_submit: bool,
        calls: Vec<&'static str>,
        rebuild_count: usize,
    }

    impl FrameTarget for FakeTarget {
        fn acquire(&mut self, _timeout: Duration) -> Result<AcquireOutcome> {
            self.calls.push("acquire");
            Ok(self.acquires.pop_front().unwrap_or(AcquireOutcome::Ready {
                index: 0,
                suboptimal: false,
            }))
        }

        fn submit(&mut self, _image_index: u32) -> Result<()> {
            self.calls.push("submit");
            if self.fail_submit {
                return Err(Error::Gpu(GpuError::Vulkan {
                    call: "vkQueueSubmit",
                    result: vk::Result::ERROR_DEVICE_LOST,
                }));
            }
            Ok(())
        }

        fn present(&mut self, _image_index: u32) -> Result<PresentOutcome> {
            self.calls.push("present");
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn rebuild(&mut self) -> Result<bool> {
            self.calls.push("rebuild");
            self.rebuild_count += 1;
            Ok(self.rebuilds.pop_front().unwrap_or(true))
        }
    }

    fn presentation_loop() -> PresentationLoop {
        PresentationLoop::new(Duration::from_millis(250))
    }

    #[test]
    fn test_normal_cycle() {
        let mut target = FakeTarget::default();
        let mut pl = presentation_loop();

        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Presented);
        assert_eq!(target.calls, ["acquire", "submit", "present"]);
        assert_eq!(pl.state(), PresentState::Idle);
        assert_eq!(pl.frames_presented(), 1);
    }

    #[test]
    fn test_out_of_date_on_present_recovers_once() {
        let mut target = FakeTarget {
            presents: VecDeque::from([PresentOutcome::OutOfDate]),
            ..Default::default()
        };
        let mut pl = presentation_loop();

        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Recovered);
        assert_eq!(target.rebuild_count, 1);
        assert_eq!(pl.state(), PresentState::Idle);

        for _ in 0..3 {
            assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Presented);
        }
        assert_eq!(target.rebuild_count, 1, "no extra rebuilds after recovery");
        assert_eq!(pl.frames_presented(), 3, "out-of-date frame was not counted");
    }

    #[test]
    fn test_repeated_invalidations_recover_once_each() {
        let mut target = FakeTarget {
            acquires: VecDeque::from([
                AcquireOutcome::OutOfDate,
                AcquireOutcome::Ready { index: 0, suboptimal: false },
                AcquireOutcome::OutOfDate,
            ]),
            presents: VecDeque::from([PresentOutcome::OutOfDate]),
            ..Default::default()
        };
        let mut pl = presentation_loop();

        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Recovered);
        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Recovered);
        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Recovered);
        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Presented);

        assert_eq!(target.rebuild_count, 3);
        assert_eq!(pl.recoveries(), 3);
    }

    #[test]
    fn test_timeout_is_a_retry() {
        let mut target = FakeTarget {
            acquires: VecDeque::from([AcquireOutcome::NotReady]),
            ..Default::default()
        };
        let mut pl = presentation_loop();

        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Retry);
        assert_eq!(target.calls, ["acquire"], "nothing submitted");
        assert_eq!(pl.state(), PresentState::Idle);
    }

    #[test]
    fn test_suboptimal_presents_then_rebuilds() {
        let mut target = FakeTarget {
            acquires: VecDeque::from([AcquireOutcome::Ready { index: 1, suboptimal: true }]),
            ..Default::default()
        };
        let mut pl = presentation_loop();

        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Presented);
        assert_eq!(pl.state(), PresentState::Invalidated);
        assert_eq!(target.rebuild_count, 0);

        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Recovered);
        assert_eq!(target.rebuild_count, 1);

        let mut target = FakeTarget {
            presents: VecDeque::from([PresentOutcome::Suboptimal]),
            ..Default::default()
        };
        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Presented);
        assert_eq!(pl.state(), PresentState::Invalidated);
    }

    #[test]
    fn test_deferred_rebuild_stays_invalidated() {
        let mut target = FakeTarget {
            rebuilds: VecDeque::from([false, false, true]),
            ..Default::default()
        };
        let mut pl = presentation_loop();
        pl.invalidate();

        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Deferred);
        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Deferred);
        assert_eq!(pl.state(), PresentState::Invalidated);
        assert!(!target.calls.contains(&"acquire"), "no acquire while invalidated");

        assert_eq!(pl.run_cycle(&mut target).unwrap(), FrameStatus::Recovered);
        assert_eq!(pl.recoveries(), 1);
    }

    #[test]
    fn test_submit_error_surfaces() {
        let mut target = FakeTarget {
            fail_submit: true,
            ..Default::default()
        };
        let mut pl = presentation_loop();

        let err = pl.run_cycle(&mut target).unwrap_err();
        assert!(!err.is_recoverable());
        assert!(!target.calls.contains(&"present"));
        assert_eq!(pl.state(), PresentState::Idle);
    }
}
