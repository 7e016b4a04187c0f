// Interrupt Descriptor Table
//
// CPU exceptions 0-19 are installed at ring 0. The page-fault handler
// cooperates with the kernel heap (demand fill); every other exception is
// fatal. Double fault and machine check log to the raw serial port and halt
// without touching the heap or any lock-protected console state.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::mm::page_fault::{self, FaultDecision};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        // SAFETY: The IST index refers to the dedicated double-fault stack
        // installed in the TSS by gdt::init.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_fp_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_fp_handler);

        // Remapped hardware interrupts. IRQ0 (timer) gets its own handler
        // so it can inspect the interrupted frame's flags.
        idt[super::irq::PIC_1_OFFSET].set_handler_fn(timer_interrupt_handler);
        idt[super::irq::PIC_1_OFFSET + 1].set_handler_fn(irq1_handler);
        idt[super::irq::PIC_1_OFFSET + 3].set_handler_fn(irq3_handler);
        idt[super::irq::PIC_1_OFFSET + 4].set_handler_fn(irq4_handler);
        idt[super::irq::PIC_1_OFFSET + 5].set_handler_fn(irq5_handler);
        idt[super::irq::PIC_1_OFFSET + 6].set_handler_fn(irq6_handler);
        idt[super::irq::PIC_1_OFFSET + 7].set_handler_fn(irq7_handler);
        idt[super::irq::PIC_1_OFFSET + 8].set_handler_fn(irq8_handler);
        idt[super::irq::PIC_1_OFFSET + 9].set_handler_fn(irq9_handler);
        idt[super::irq::PIC_1_OFFSET + 10].set_handler_fn(irq10_handler);
        idt[super::irq::PIC_1_OFFSET + 11].set_handler_fn(irq11_handler);
        idt[super::irq::PIC_1_OFFSET + 12].set_handler_fn(irq12_handler);
        idt[super::irq::PIC_1_OFFSET + 13].set_handler_fn(irq13_handler);
        idt[super::irq::PIC_1_OFFSET + 14].set_handler_fn(irq14_handler);
        idt[super::irq::PIC_1_OFFSET + 15].set_handler_fn(irq15_handler);

        idt
    };
}

pub fn init() {
    IDT.load();
    log::info!("CPU exception handlers installed");
}

fn fatal_fault(name: &str, stack_frame: &InterruptStackFrame, error_code: Option<u64>) -> ! {
    log::error!("EXCEPTION: {}", name);
    if let Some(code) = error_code {
        log::error!("  error code {:#x}", code);
    }
    log::error!(
        "  rip {:#x} rsp {:#x} rflags {:#x}",
        stack_frame.instruction_pointer.as_u64(),
        stack_frame.stack_pointer.as_u64(),
        stack_frame.cpu_flags.bits(),
    );
    if let Some(proc) = crate::process::current_name_for_fault() {
        log::error!("  faulting process: {}", proc);
    }
    panic!("{}", name);
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    fatal_fault("DIVIDE ERROR", &stack_frame, None);
}

extern "x86-interrupt" fn debug_handler(stack_frame: InterruptStackFrame) {
    log::warn!("DEBUG exception at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn nmi_handler(stack_frame: InterruptStackFrame) {
    fatal_fault("NON-MASKABLE INTERRUPT", &stack_frame, None);
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("BREAKPOINT at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn overflow_handler(stack_frame: InterruptStackFrame) {
    fatal_fault("OVERFLOW", &stack_frame, None);
}

extern "x86-interrupt" fn bound_range_handler(stack_frame: InterruptStackFrame) {
    fatal_fault("BOUND RANGE EXCEEDED", &stack_frame, None);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    fatal_fault("INVALID OPCODE", &stack_frame, None);
}

extern "x86-interrupt" fn device_not_available_handler(stack_frame: InterruptStackFrame) {
    fatal_fault("DEVICE NOT AVAILABLE", &stack_frame, None);
}

/// Double fault: minimal raw-serial report, then halt. No heap, no locks.
extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    crate::serial::emergency_write(format_args!(
        "\nDOUBLE FAULT (code {:#x}) rip={:#x}\n",
        error_code,
        stack_frame.instruction_pointer.as_u64()
    ));
    loop {
        crate::arch::halt();
    }
}

extern "x86-interrupt" fn invalid_tss_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    fatal_fault("INVALID TSS", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn segment_not_present_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal_fault("SEGMENT NOT PRESENT", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn stack_segment_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal_fault("STACK SEGMENT FAULT", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn general_protection_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal_fault("GENERAL PROTECTION FAULT", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let cr2 = Cr2::read_raw();
    let code = error_code.bits();
    let rip = stack_frame.instruction_pointer.as_u64();

    if !page_fault::enter() {
        crate::serial::emergency_write(format_args!(
            "\nNESTED PAGE FAULT at {:#x} rip={:#x}\n",
            cr2, rip
        ));
        loop {
            crate::arch::halt();
        }
    }

    match page_fault::classify(cr2, code) {
        FaultDecision::DemandFillHeap { page } => {
            if let Err(e) = page_fault::demand_fill_heap(page) {
                page_fault::report_fatal(cr2, code, rip);
                page_fault::leave();
                panic!("page fault in heap window: {}", e);
            }
            page_fault::leave();
        }
        FaultDecision::Fatal => {
            page_fault::report_fatal(cr2, code, rip);
            page_fault::leave();
            panic!("unhandled page fault at {:#x}", cr2);
        }
    }
}

extern "x86-interrupt" fn x87_fp_handler(stack_frame: InterruptStackFrame) {
    fatal_fault("x87 FLOATING POINT", &stack_frame, None);
}

extern "x86-interrupt" fn alignment_check_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal_fault("ALIGNMENT CHECK", &stack_frame, Some(error_code));
}

/// Machine check: raw serial only, halt forever.
extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    crate::serial::emergency_write(format_args!(
        "\nMACHINE CHECK rip={:#x}\n",
        stack_frame.instruction_pointer.as_u64()
    ));
    loop {
        crate::arch::halt();
    }
}

extern "x86-interrupt" fn simd_fp_handler(stack_frame: InterruptStackFrame) {
    fatal_fault("SIMD FLOATING POINT", &stack_frame, None);
}

/// IRQ0: the scheduler tick. Preemption is allowed only when the
/// interrupted frame had interrupts enabled (IF set), so code running in a
/// critical section is never switched out.
extern "x86-interrupt" fn timer_interrupt_handler(stack_frame: InterruptStackFrame) {
    let if_was_set = stack_frame
        .cpu_flags
        .contains(x86_64::registers::rflags::RFlags::INTERRUPT_FLAG);
    let preempt = super::timer::handle_tick(if_was_set);
    super::irq::end_of_interrupt(0);
    if preempt {
        crate::sched::schedule();
    }
}

macro_rules! irq_handler {
    ($name:ident, $line:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            super::irq::dispatch($line);
        }
    };
}

irq_handler!(irq1_handler, 1);
irq_handler!(irq3_handler, 3);
irq_handler!(irq4_handler, 4);
irq_handler!(irq5_handler, 5);
irq_handler!(irq6_handler, 6);
irq_handler!(irq7_handler, 7);
irq_handler!(irq8_handler, 8);
irq_handler!(irq9_handler, 9);
irq_handler!(irq10_handler, 10);
irq_handler!(irq11_handler, 11);
irq_handler!(irq12_handler, 12);
irq_handler!(irq13_handler, 13);
irq_handler!(irq14_handler, 14);
irq_handler!(irq15_handler, 15);
