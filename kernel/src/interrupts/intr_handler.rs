use crate::mem::fault::PageFault;
use crate::mem::Vm;
use crate::process::Process;
use log::{debug, info};
use pagekit_shared::mem::{PhysAddr, VirtAddr};

/* Handlers the trap stubs call once they have saved the user context and
 * read the fault address from cr2. They run in the context of the process
 * that trapped.
 */

/// Software interrupt vector of the diagnostic inspect call.
pub const INSPECT_VECTOR: u8 = 0x42;

/// Resolves `fault` for `process`. Returns whether the faulting access may
/// be retried; if not, the process has been told to exit with status -1.
pub fn page_fault_handler(vm: &Vm, process: &dyn Process, fault: &PageFault) -> bool {
    match vm.try_handle_fault(process.address_space(), fault) {
        Ok(()) => true,
        Err(err) => {
            debug!(
                "{}: {} fault at {:#x}: {err}",
                process.name(),
                if fault.write { "write" } else { "read" },
                fault.addr
            );
            info!("{}: exit(-1)", process.name());
            process.exit(-1);
            false
        }
    }
}

/// Returns the physical address of the frame `va` is mapped to in
/// `process`, or 0 if it has none.
pub fn inspect_handler(vm: &Vm, process: &dyn Process, va: VirtAddr) -> PhysAddr {
    vm.inspect(process.address_space(), va).unwrap_or(0)
}
