use kidneyvm_shared::mem::{PAGE_FRAME_SIZE, USER_STACK_MAX_SIZE};

/// Boot-time tunables of the VM subsystem.
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Frames in the user pool. Every user page that is resident occupies one.
    pub user_frames: usize,
    /// How many pages below `OFFSET` the stack may grow to.
    pub max_stack_pages: usize,
    /// How far below the saved stack pointer an access may land and still
    /// count as stack growth. 32 bytes covers x86 `PUSHA`.
    pub stack_slack: usize,
    /// Full clock sweeps the eviction scan makes before giving up.
    pub eviction_passes: usize,
}

impl VmConfig {
    /// Lowest address of the stack reservation.
    pub fn stack_limit(&self) -> usize {
        kidneyvm_shared::mem::OFFSET - self.max_stack_pages * PAGE_FRAME_SIZE
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: 256,
            max_stack_pages: USER_STACK_MAX_SIZE / PAGE_FRAME_SIZE,
            stack_slack: 32,
            eviction_passes: 2,
        }
    }
}
