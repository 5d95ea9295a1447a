//! Interrupt descriptor table and the raw interrupt entry stubs.
//!
//! The timer and forced-yield vectors need the interrupted context's stack
//! pointer, so they are naked stubs that push the general-purpose register
//! set, hand rsp to the scheduler and load whatever rsp comes back. The
//! syscall gate builds the same frame and lets the dispatcher patch the
//! saved rax with the result.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

use super::exceptions;
use crate::scheduler::context::InterruptFrame;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

pub const SYSCALL_VECTOR: usize = 0x80;
pub const YIELD_VECTOR: usize = crate::arch::YIELD_VECTOR as usize;

/// Mask every IRQ except the timer and the keyboard.
const MASTER_RUNNING_MASK: u8 = !((1 << 0) | (1 << 1));
const SLAVE_RUNNING_MASK: u8 = 0xFF;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        unsafe {
            idt.divide_error
                .set_handler_addr(VirtAddr::new(exceptions::divide_error_entry as usize as u64));
            idt.invalid_opcode
                .set_handler_addr(VirtAddr::new(
                    exceptions::invalid_opcode_entry as usize as u64,
                ));
            idt[InterruptIndex::Timer.as_usize()]
                .set_handler_addr(VirtAddr::new(timer_interrupt_entry as usize as u64));
            idt[YIELD_VECTOR]
                .set_handler_addr(VirtAddr::new(yield_interrupt_entry as usize as u64));
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(syscall_interrupt_entry as usize as u64));
        }
        idt[InterruptIndex::Keyboard.as_usize()].set_handler_fn(keyboard_interrupt_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
    unsafe {
        PICS.lock().initialize();
        PICS.lock().write_masks(MASTER_RUNNING_MASK, SLAVE_RUNNING_MASK);
    }
}

/// Restrict interrupts to the keyboard while an exception screen waits for
/// acknowledgement.
pub fn mask_all_but_keyboard() {
    unsafe {
        PICS.lock().write_masks(!(1 << 1), SLAVE_RUNNING_MASK);
    }
}

pub fn restore_running_mask() {
    unsafe {
        PICS.lock().write_masks(MASTER_RUNNING_MASK, SLAVE_RUNNING_MASK);
    }
}

extern "C" fn timer_tick_handler(rsp: u64) -> u64 {
    crate::drivers::time::timer_tick();
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    crate::scheduler::schedule(rsp)
}

extern "C" fn syscall_frame_handler(frame: &mut InterruptFrame) {
    crate::syscalls::dispatch(frame);
}

#[unsafe(naked)]
pub extern "C" fn timer_interrupt_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "mov rsp, rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym timer_tick_handler,
    );
}

/// Same stack swap as the timer path, without the tick or the EOI: this
/// vector is raised by software through `int`.
#[unsafe(naked)]
pub extern "C" fn yield_interrupt_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "mov rsp, rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym crate::scheduler::schedule,
    );
}

#[unsafe(naked)]
pub extern "C" fn syscall_interrupt_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym syscall_frame_handler,
    );
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    crate::log_error!("EXCEPTION: PAGE FAULT");
    crate::log_error!("Accessed Address: {:?}", Cr2::read());
    crate::log_error!("Error Code: {:?}", error_code);
    panic!("EXCEPTION: PAGE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT\nError Code: {error_code}\n{:#?}",
        stack_frame
    );
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;
    let mut port: Port<u8> = Port::new(0x60);
    let scancode = unsafe { port.read() };

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }

    crate::drivers::keyboard::push_scancode(scancode);
}
