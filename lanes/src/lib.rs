// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

#![forbid(unsafe_code)]

pub mod arch;
pub mod asm;
pub mod coding;
pub mod instruction;
pub mod memory;
pub mod op;
pub mod program;
pub mod value;
pub mod vm;
