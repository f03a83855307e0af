//! A CAN driver which runs a test callback from inside `transmit`
//!
//! Real drivers may confirm a frame, or hand over a received one, before `transmit` returns. This
//! driver lets a test do the same: every frame is recorded, then passed to the installed hook on
//! the caller's stack while the engine is still busy with it.
use std::sync::Mutex;

use cantp_common::{CanDriver, CanFrame, CanSendError};

type Hook = Box<dyn FnMut(&CanFrame) + Send>;

#[derive(Default)]
pub struct HookDriver {
    sent: Mutex<Vec<CanFrame>>,
    hook: Mutex<Option<Hook>>,
}

impl HookDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `hook` with every frame sent from now on
    ///
    /// Frames sent while the hook itself runs are recorded but not hooked.
    pub fn set_hook(&self, hook: impl FnMut(&CanFrame) + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Every frame sent so far
    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().unwrap().clone()
    }
}

impl CanDriver for HookDriver {
    fn transmit(&self, frame: &CanFrame) -> Result<(), CanSendError> {
        self.sent.lock().unwrap().push(*frame);
        let hook = self.hook.lock().unwrap().take();
        if let Some(mut hook) = hook {
            hook(frame);
            let mut slot = self.hook.lock().unwrap();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
        Ok(())
    }
}
