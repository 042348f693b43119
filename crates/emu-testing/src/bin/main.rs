//! Standalone runner: executes the same boundary scenarios the `tests/`
//! directory checks via `#[test]`, but as a plain binary that prints a
//! pass/fail summary — useful for running the suite without `cargo test`'s
//! harness (e.g. under a debugger, or piped into a CI log), in the same
//! spirit as the donor crate's hand-rolled-args test runner but without
//! its QEMU/async machinery, which this emulator has no use for.

use std::process::ExitCode;

use emu_testing::setup_logging;

struct Scenario {
    name: &'static str,
    run: fn() -> Result<(), String>,
}

fn main() -> ExitCode {
    setup_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let filter = args.first().map(String::as_str);

    let scenarios: &[Scenario] = &[
        Scenario { name: "sum_loop", run: scenario_sum_loop },
        Scenario { name: "nested_multiply_loop", run: scenario_nested_multiply_loop },
        Scenario { name: "digit_extract_and_write", run: scenario_digit_extract },
        Scenario { name: "recursive_factorial", run: scenario_factorial },
    ];

    let mut failures = 0;
    for scenario in scenarios {
        if let Some(f) = filter {
            if scenario.name != f {
                continue;
            }
        }
        match (scenario.run)() {
            Ok(()) => println!("ok   {}", scenario.name),
            Err(msg) => {
                println!("FAIL {}: {msg}", scenario.name);
                failures += 1;
            }
        }
    }

    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn scenario_sum_loop() -> Result<(), String> {
    let code = [
        0xb8, 0x00, 0x00, 0x00, 0x00, 0xb9, 0x05, 0x00, 0x00, 0x00, 0x01, 0xc8, 0xff, 0xc9, 0x75, 0xfa, 0x89, 0xc7,
        0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05,
    ];
    run_and_check_exit(&code, &[], 15)
}

fn scenario_nested_multiply_loop() -> Result<(), String> {
    let code = [
        0xb8, 0x00, 0x00, 0x00, 0x00, 0xb9, 0x01, 0x00, 0x00, 0x00, 0xba, 0x01, 0x00, 0x00, 0x00, 0x89, 0xcb, 0x0f,
        0xaf, 0xda, 0x01, 0xd8, 0xff, 0xc2, 0x83, 0xfa, 0x03, 0x7e, 0xf2, 0xff, 0xc1, 0x83, 0xf9, 0x03, 0x7e, 0xe6,
        0x89, 0xc7, 0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05,
    ];
    run_and_check_exit(&code, &[], 36)
}

fn scenario_digit_extract() -> Result<(), String> {
    let code = [
        0xb8, 0xd2, 0x04, 0x00, 0x00, 0xb9, 0x0a, 0x00, 0x00, 0x00, 0x31, 0xd2, 0xf7, 0xf1, 0x83, 0xc2, 0x30, 0x88,
        0x14, 0x25, 0x00, 0x02, 0x00, 0x00, 0xb8, 0x01, 0x00, 0x00, 0x00, 0xbf, 0x01, 0x00, 0x00, 0x00, 0xbe, 0x00,
        0x02, 0x00, 0x00, 0xba, 0x01, 0x00, 0x00, 0x00, 0x0f, 0x05, 0xbf, 0x00, 0x00, 0x00, 0x00, 0xb8, 0x3c, 0x00,
        0x00, 0x00, 0x0f, 0x05,
    ];
    run_and_check_exit(&code, &[], 0)
}

fn scenario_factorial() -> Result<(), String> {
    let code = [
        0xbf, 0x05, 0x00, 0x00, 0x00, 0xe8, 0x09, 0x00, 0x00, 0x00, 0x89, 0xc7, 0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f,
        0x05, 0x83, 0xff, 0x01, 0x7f, 0x06, 0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0x57, 0xff, 0xcf, 0xe8, 0xed, 0xff,
        0xff, 0xff, 0x5f, 0x0f, 0xaf, 0xc7, 0xc3,
    ];
    run_and_check_exit(&code, &[], 120)
}

fn run_and_check_exit(code: &[u8], data: &[(usize, &[u8])], expected: i32) -> Result<(), String> {
    let mut mem = emu_testing::flat_image(1 << 20, code, data);
    let stack_top = (mem.len() as u64) - 4096;
    let (_insns, exit_code, _handler) = emu_testing::run_program(&mut mem, 0, stack_top).map_err(|e| e.to_string())?;
    if exit_code != expected {
        return Err(format!("expected exit {expected}, got {exit_code}"));
    }
    Ok(())
}
