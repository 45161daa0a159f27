// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use std::env::args_os;

fn main() {
    cimian::cli::run(args_os().skip(1))
}
