// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv6-M and ARMv7(E)-M.
//!
//! # The two scheduling interrupts
//!
//! All context switching funnels through two handlers, both configured at
//! the *lowest* interrupt priority in the system:
//!
//! - `SysTick` fires periodically and is the kernel's clock: it advances
//!   the tick count, wakes due sleepers, and rotates the time slice.
//! - `PendSV` is the reschedule request. Kernel calls that need a
//!   scheduling decision (yield, sleep, blocking acquire, waking a more
//!   important task from an ISR) just set its pending bit and return; the
//!   switch happens when the pend fires.
//!
//! Running both at the lowest priority means neither can preempt a device
//! ISR, and a device ISR that pends a reschedule gets it exactly when it
//! returns. The handlers themselves can be *entered* while a task is
//! mid-syscall, which is why every kernel mutation anywhere happens under
//! a PRIMASK critical section.
//!
//! Both handler symbols have the fixed names the Cortex-M vector table
//! expects, so linking this crate into a `cortex-m-rt` application wires
//! them up with no further ceremony.
//!
//! # Context-switch discipline
//!
//! On the way into either handler, the assembly prologue pushes the
//! callee-saved registers (and, on FPU parts with an active
//! floating-point context, the callee-saved FP registers) onto the
//! *outgoing task's* stack, then records the resulting stack pointer and
//! exception-return word in its TCB. The Rust handler body picks the next
//! task; the epilogue then restores symmetrically from the *incoming*
//! task's TCB and returns from the exception into it. The hardware pushed
//! r0-r3/r12/lr/pc/xPSR on entry and pops them on return, which is what
//! makes the 16-word synthetic frame built by [`reinitialize`] sufficient
//! to start a brand-new task.
//!
//! Tasks run privileged, in Thread mode, on the process stack (CONTROL =
//! 2): kernel entry points are ordinary function calls that need the
//! authority to mask interrupts. There is no memory isolation here.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::task::Task;

// Kernel log output. ITM is cheap but needs a probe configured for SWO;
// semihosting works under any debugger but stalls the CPU per message.
// With neither feature, logs compile to nothing.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        if !($left == $right) {
            panic!("Assertion failed!");
        }
    };
}

/// On ARMvx-M we have to use a global to record the current task pointer,
/// since we don't have a scratch register; the handler prologue and
/// epilogue below address the TCB through it.
#[no_mangle]
static CURRENT_TASK_PTR: AtomicPtr<Task> =
    AtomicPtr::new(core::ptr::null_mut());

/// The running task's opaque runtime-context pointer, refreshed on every
/// context switch. A C-runtime shim (say, a newlib `__getreent`) can read
/// this symbol to give each task its own errno and stdio state.
#[no_mangle]
pub static TASK_RUNTIME_CTX: AtomicPtr<core::ffi::c_void> =
    AtomicPtr::new(core::ptr::null_mut());

/// Core clock, recorded at startup so the busy-wait helper (and a
/// debugger) can find it.
#[no_mangle]
static CLOCK_FREQ_HZ: AtomicU32 = AtomicU32::new(0);

/// SysTick reload interval in CPU cycles, i.e. cycles per kernel tick.
static TICK_DIVISOR: AtomicU32 = AtomicU32::new(0);

/// Per-task machine state that lives in the TCB rather than on the task
/// stack: where the stack pointer ended up after the prologue pushed
/// everything else, and which exception-return flavor resumes the task.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    // NOTE: the handler assembly addresses these two fields by offset
    // through CURRENT_TASK_PTR; keep them first and in this order.
    psp: u32,
    exc_return: u32,
}

/// Stuff placed on the stack at exception entry whether or not an FPU is
/// present.
#[derive(Debug, Default, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// The 16-word synthetic frame seeded at the top of a fresh task stack:
/// the eight software-saved registers directly below the hardware frame,
/// exactly as the handler prologue would have left them.
#[derive(Debug, Default, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct StartFrame {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    base: BaseExceptionFrame,
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// Exception return into Thread mode on the process stack, standard
/// (non-FP) frame. Fresh tasks have no FP context; on FPU parts the
/// hardware flips the frame bit the first time a task touches the FPU and
/// the saved `exc_return` carries it from then on.
const EXC_RETURN_CONST: u32 = 0xFFFFFFFD;

/// Pattern the optional stack paint fills with, one storied word at a
/// time, so a debugger can read the high-water mark off a stopped target.
#[cfg(feature = "stack-paint")]
const STACK_PAINT_WORD: u32 = 0xbaddcafe;

/// Builds `task`'s synthetic initial frame. Restoring this frame and
/// returning from an exception lands in the task trampoline with the
/// task's id in r0.
pub fn reinitialize(task: &mut Task) {
    let top = task.stack_base + task.stack_size;
    // Modern ARMvX-M machines require 8-byte stack alignment; task init
    // already rounded the top down.
    uassert!(top & 0x7 == 0);

    let frame_addr = top - core::mem::size_of::<StartFrame>();
    uassert!(frame_addr >= task.stack_base);

    #[cfg(feature = "stack-paint")]
    {
        let mut addr = (task.stack_base + 3) & !0x3;
        while addr < frame_addr {
            // Safety: within the task's stack, below the frame.
            unsafe {
                (addr as *mut u32).write_volatile(STACK_PAINT_WORD);
            }
            addr += 4;
        }
    }

    let mut frame = StartFrame::default();
    frame.base.r0 = u32::from(task.id.0);
    frame.base.lr = crate::task::task_return_trap as usize as u32;
    frame.base.pc = crate::task::task_entry_trampoline as usize as u32;
    frame.base.xpsr = INITIAL_PSR;

    // Safety: frame_addr..top lies inside the stack region the caller
    // handed over for this task, and is 8-byte aligned.
    unsafe {
        (frame_addr as *mut StartFrame).write(frame);
    }

    task.save = SavedState {
        psp: frame_addr as u32,
        exc_return: EXC_RETURN_CONST,
    };
}

/// Runs `body` with interrupts globally masked: the kernel's one critical
/// section. Nesting is fine; the outermost call restores the mask.
pub fn with_interrupts_masked<R>(body: impl FnOnce() -> R) -> R {
    cortex_m::interrupt::free(|_| body())
}

/// Requests a reschedule by pending PendSV. The switch happens once the
/// pend can fire: immediately from task context with interrupts unmasked,
/// at critical-section exit otherwise, or after the active ISR (and any
/// chained ones) returns.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Publishes `task` as the running task for the handler assembly and the
/// C-runtime shim.
fn update_current(task: &Task) {
    TASK_RUNTIME_CTX.store(task.runtime_ctx(), Ordering::Relaxed);
    CURRENT_TASK_PTR
        .store(task as *const Task as *mut Task, Ordering::Relaxed);
}

/// Records the core clock for `busy_wait_us` and debuggers.
pub fn set_clock_freq(cpu_hz: u32) {
    CLOCK_FREQ_HZ.store(cpu_hz, Ordering::Relaxed);
}

/// Configures the tick and priorities, then dispatches `task` by
/// unwinding its synthetic frame by hand: switch Thread mode onto the
/// process stack and branch into the trampoline the frame points at.
///
/// # Safety
///
/// Call once, from the reset path, with `task` chosen and marked Running
/// by the kernel. Must be running privileged in Thread mode on the main
/// stack.
pub unsafe fn start_first_task(tick_divisor: u32, task: &mut Task) -> ! {
    uassert!(tick_divisor > 0);

    // Safety: lowering exception priorities and programming the timer;
    // the register API is unsafe but nothing here can alias Rust state.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // SysTick and PendSV at the lowest priority, so the scheduler can
        // never preempt a device ISR.
        cfg_if::cfg_if! {
            if #[cfg(armv6m)] {
                scb.shpr[1].modify(|x| x | 0b11 << 22 | 0b11 << 30);
            } else if #[cfg(armv7m)] {
                scb.shpr[10].write(0xFF);
                scb.shpr[11].write(0xFF);
            } else {
                compile_error!("missing priority setup for ARM profile");
            }
        }

        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(tick_divisor - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt, clocked from the core.
        syst.csr.modify(|v| v | 0b111);
    }

    TICK_DIVISOR.store(tick_divisor, Ordering::Relaxed);
    update_current(task);

    klog!("entering task context");

    let frame = task.save.psp as *const StartFrame;
    // Safety: reinitialize put a valid frame there and nothing has run to
    // disturb it.
    let frame = unsafe { &*frame };
    let stack_top = task.save.psp + core::mem::size_of::<StartFrame>() as u32;

    // Safety: consumes the frame exactly once and never returns. CONTROL
    // bit 1 moves Thread mode onto the PSP we just set; the ISB makes the
    // switch architecturally done before the branch.
    unsafe {
        core::arch::asm!(
            "msr APSR_nzcvq, {xpsr}",
            "msr PSP, {stack}",
            "msr CONTROL, {ctrl}",
            "isb",
            "bx {entry}",
            xpsr = in(reg) frame.base.xpsr,
            stack = in(reg) stack_top,
            ctrl = in(reg) 2u32,
            entry = in(reg) frame.base.pc,
            in("r0") frame.base.r0,
            options(noreturn),
        )
    }
}

/// Busy-waits at least `us` microseconds by accumulating SysTick
/// down-counts. Does not deschedule; meant for sub-tick delays. Only
/// valid once the scheduler (and thus the tick) is running.
pub fn busy_wait_us(us: u32) {
    let freq = CLOCK_FREQ_HZ.load(Ordering::Relaxed);
    let reload = TICK_DIVISOR.load(Ordering::Relaxed);
    uassert!(freq != 0 && reload != 0);

    let target = u64::from(us) * u64::from(freq) / 1_000_000;
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };

    let mut last = syst.cvr.read();
    let mut elapsed: u64 = 0;
    while elapsed < target {
        let now = syst.cvr.read();
        // The counter runs toward zero and jumps back to the reload
        // value; polling is far faster than a tick, so at most one wrap
        // lies between samples.
        let delta = if now <= last {
            last - now
        } else {
            last + reload - now
        };
        elapsed += u64::from(delta);
        last = now;
    }
}

/// The Rust side of the tick handler, after the prologue has saved the
/// outgoing task's context.
#[no_mangle]
unsafe extern "C" fn systick_entry() {
    crate::kernel::with_kernel(|k| {
        let next = k.on_tick();
        update_current(next);
    });
}

/// The Rust side of the reschedule handler, ditto.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    crate::kernel::with_kernel(|k| {
        let next = k.on_reschedule();
        update_current(next);
    });
}

// Handler bodies. The prologue saves the callee-saved state the hardware
// didn't, onto the outgoing task's stack, and records PSP (+ EXC_RETURN)
// in the TCB; the epilogue mirrors it from the possibly-different current
// TCB. Offsets 0 and 4 into the TCB are SavedState's psp and exc_return.
cfg_if::cfg_if! {
    if #[cfg(all(armv7m, have_fpu))] {
        core::arch::global_asm! {"
            .section .text.SysTick
            .globl SysTick
            .type SysTick,function
            SysTick:
                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r0]
                mrs r2, PSP
                stmdb r2!, {{r4-r11}}
                @ If the task has live FP state (EXC_RETURN bit 4 clear),
                @ stack the callee-saved half; this also forces the lazy
                @ caller-saved stacking to happen now.
                tst lr, #0x10
                it eq
                vstmdbeq r2!, {{d8-d15}}
                str r2, [r1]
                str lr, [r1, #4]

                bl systick_entry

                @ we return into *some* task, maybe not the same one.
                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r0]
                ldr r2, [r1]
                ldr lr, [r1, #4]
                tst lr, #0x10
                it eq
                vldmiaeq r2!, {{d8-d15}}
                ldmia r2!, {{r4-r11}}
                msr PSP, r2
                bx lr

            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r0]
                mrs r2, PSP
                stmdb r2!, {{r4-r11}}
                tst lr, #0x10
                it eq
                vstmdbeq r2!, {{d8-d15}}
                str r2, [r1]
                str lr, [r1, #4]

                bl pendsv_entry

                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r0]
                ldr r2, [r1]
                ldr lr, [r1, #4]
                tst lr, #0x10
                it eq
                vldmiaeq r2!, {{d8-d15}}
                ldmia r2!, {{r4-r11}}
                msr PSP, r2
                bx lr
        "}
    } else if #[cfg(armv7m)] {
        core::arch::global_asm! {"
            .section .text.SysTick
            .globl SysTick
            .type SysTick,function
            SysTick:
                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r0]
                mrs r2, PSP
                stmdb r2!, {{r4-r11}}
                str r2, [r1]
                str lr, [r1, #4]

                bl systick_entry

                @ we return into *some* task, maybe not the same one.
                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r0]
                ldr r2, [r1]
                ldr lr, [r1, #4]
                ldmia r2!, {{r4-r11}}
                msr PSP, r2
                bx lr

            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r0]
                mrs r2, PSP
                stmdb r2!, {{r4-r11}}
                str r2, [r1]
                str lr, [r1, #4]

                bl pendsv_entry

                movw r0, #:lower16:CURRENT_TASK_PTR
                movt r0, #:upper16:CURRENT_TASK_PTR
                ldr r1, [r0]
                ldr r2, [r1]
                ldr lr, [r1, #4]
                ldmia r2!, {{r4-r11}}
                msr PSP, r2
                bx lr
        "}
    } else if #[cfg(armv6m)] {
        // v6-M: only the low registers work with stm/ldm, and there is no
        // FPU, so the exception return is always the plain thread+PSP
        // flavor.
        core::arch::global_asm! {"
            .section .text.SysTick
            .globl SysTick
            .type SysTick,function
            SysTick:
                mrs r0, PSP
                subs r0, #32
                stmia r0!, {{r4-r7}}
                mov r4, r8
                mov r5, r9
                mov r6, r10
                mov r7, r11
                stmia r0!, {{r4-r7}}
                subs r0, #32
                ldr r1, =CURRENT_TASK_PTR
                ldr r1, [r1]
                str r0, [r1]

                bl systick_entry

                @ we return into *some* task, maybe not the same one.
                ldr r0, =CURRENT_TASK_PTR
                ldr r0, [r0]
                ldr r0, [r0]
                movs r1, #16
                add r1, r0
                ldmia r1!, {{r4-r7}}
                mov r8, r4
                mov r9, r5
                mov r10, r6
                mov r11, r7
                msr PSP, r1
                ldmia r0!, {{r4-r7}}
                ldr r0, =0xFFFFFFFD
                mov lr, r0
                bx lr

            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, PSP
                subs r0, #32
                stmia r0!, {{r4-r7}}
                mov r4, r8
                mov r5, r9
                mov r6, r10
                mov r7, r11
                stmia r0!, {{r4-r7}}
                subs r0, #32
                ldr r1, =CURRENT_TASK_PTR
                ldr r1, [r1]
                str r0, [r1]

                bl pendsv_entry

                ldr r0, =CURRENT_TASK_PTR
                ldr r0, [r0]
                ldr r0, [r0]
                movs r1, #16
                add r1, r0
                ldmia r1!, {{r4-r7}}
                mov r8, r4
                mov r9, r5
                mov r10, r6
                mov r11, r7
                msr PSP, r1
                ldmia r0!, {{r4-r7}}
                ldr r0, =0xFFFFFFFD
                mov lr, r0
                bx lr
        "}
    } else {
        compile_error!("missing context-switch handlers for ARM profile");
    }
}
