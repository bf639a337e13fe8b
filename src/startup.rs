/*
 * Application Bootstrap
 *
 * The kernel-side half of program startup: install the port, initialize
 * the kernel tables, create the application main thread and hand the CPU
 * to the scheduler. The main thread runs `os_main`; its integer return
 * becomes the program exit status, reported to the host through the
 * port's semihosting-style `terminate` hook (0 = success).
 */

use spin::Mutex;

use crate::config::MAIN_STACK_SIZE;
use crate::errno::Result;
use crate::port::{self, Port};
use crate::sched::{self, Priority, Stack, thread};

/// Application entry function: receives the argument given to `run` and
/// returns the program exit status.
pub type MainFn = fn(usize) -> i32;

static mut MAIN_STACK: [u8; MAIN_STACK_SIZE] = [0; MAIN_STACK_SIZE];

/// Dispatch record for the main thread; written once before the
/// scheduler starts.
static MAIN_DISPATCH: Mutex<Option<MainFn>> = Mutex::new(None);

/// Boot the system: port, kernel, main thread, scheduler. On a real
/// port this never returns on success.
pub fn run(p: &'static dyn Port, os_main: MainFn, arg: usize) -> Result<()> {
    port::install(p);
    sched::init();

    *MAIN_DISPATCH.lock() = Some(os_main);

    let stack = unsafe { Stack::from_raw((&raw mut MAIN_STACK).cast::<u8>(), MAIN_STACK_SIZE) };
    thread::spawn(main_thread, arg, "main", Priority::NORMAL, stack)?;

    sched::start()
}

/// Body of the application main thread.
fn main_thread(arg: usize) {
    let os_main = MAIN_DISPATCH.lock().take();
    let status = match os_main {
        Some(f) => f(arg),
        None => 0,
    };
    log::info!("os_main returned {}", status);
    if let Some(p) = port::active() {
        p.terminate(status);
    }
}
