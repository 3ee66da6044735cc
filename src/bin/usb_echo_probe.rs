// Copyright (C) 2023, Alex Badics
// This file is part of usb-echo-probe
// Licensed under the MIT license. See LICENSE file in the project root for details.

use std::io::Write;

use log::debug;

use usb_echo_probe::{
    open_device_vid_pid,
    probe::{self, PRODUCT_ID, VENDOR_ID},
    Result,
};

fn main() -> Result<()> {
    env_logger::init();
    let mut stdout = std::io::stdout().lock();
    let outcome = probe::run(&mut stdout, || open_device_vid_pid(VENDOR_ID, PRODUCT_ID))?;
    stdout.flush()?;
    debug!("Probe finished: {outcome:?}");
    Ok(())
}
