//! Resolving page faults (interrupt 14).

use crate::mem::vm_error::VmError;
use crate::user_program::process::Process;
use kidneyvm_shared::{mem::is_kernel_vaddr, paging::PageFaultErrorCode};
use log::warn;

/// What the trap handler reports about a page fault.
#[derive(Clone, Copy, Debug)]
pub struct PageFault {
    /// The address that could not be accessed (`cr2`).
    pub fault_addr: usize,
    pub error_code: PageFaultErrorCode,
    /// Stack pointer at the time of the fault. Only meaningful for faults
    /// raised in user mode.
    pub esp: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page is now mapped; retry the faulting instruction.
    Resumed,
    /// The access was invalid and the process has exited with status -1.
    Killed,
}

/// Handles a page fault taken by `process`.
///
/// A fault on a known page loads it. A fault just below the stack pointer
/// inside the stack reservation grows the stack. Anything else, including
/// every protection violation, terminates the process.
pub fn handle_page_fault(process: &Process, fault: &PageFault) -> FaultResolution {
    match resolve(process, fault) {
        Ok(()) => FaultResolution::Resumed,
        Err(e) if e.is_fatal() => e.halt(),
        Err(e) => {
            warn!(
                "{}: page fault at {:#x} ({} {} in {} mode): {}",
                process.name(),
                fault.fault_addr,
                if fault.error_code.present() {
                    "rights violation"
                } else {
                    "not present"
                },
                if fault.error_code.write() { "writing" } else { "reading" },
                if fault.error_code.user() { "user" } else { "kernel" },
                e
            );
            process.exit(-1);
            FaultResolution::Killed
        }
    }
}

fn resolve(process: &Process, fault: &PageFault) -> Result<(), VmError> {
    let addr = fault.fault_addr;
    if fault.error_code.present() {
        return Err(VmError::ReadOnly);
    }
    if is_kernel_vaddr(addr) {
        return Err(VmError::BadAddress);
    }

    let sys = process.system();
    let spt = process.spt();
    if spt.exists(addr) {
        return spt.fault_in(sys, addr, false);
    }

    // A kernel-mode fault happened while copying through a user pointer, so
    // the user stack pointer is the one saved on entry to the kernel.
    let esp = if fault.error_code.user() {
        fault.esp
    } else {
        process.user_esp()
    };
    let in_reservation = addr >= sys.config.stack_limit();
    let near_esp = addr.saturating_add(sys.config.stack_slack) >= esp;
    if in_reservation && near_esp {
        return spt.grow_stack(sys, addr);
    }

    Err(VmError::BadAddress)
}
