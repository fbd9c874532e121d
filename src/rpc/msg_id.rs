// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::cell::Cell;

use rand::Rng;

const MSG_ID_LEN: u32 = 17;

thread_local! {
    static NEXT_MSG_ID: Cell<u64> = const { Cell::new(0) };
    static MAX_MSG_ID: Cell<u64> = const { Cell::new(0) };
}

/// Generates a unique decimal ASCII msg-id.
///
/// Each thread draws a random block of ids once and hands them out
/// sequentially, re-seeding when the block is exhausted.
pub fn gen_msg_id() -> String {
    let id = NEXT_MSG_ID.with(|next| {
        MAX_MSG_ID.with(|max| {
            let mut current = next.get();
            if current == 0 || current >= max.get() {
                let ceiling = 10u64.pow(MSG_ID_LEN);
                current = rand::rng().random_range(1..ceiling / 2);
                max.set(ceiling);
            }
            next.set(current + 1);
            current
        })
    });
    format!("{id:017}")
}
