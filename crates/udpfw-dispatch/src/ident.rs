//! Client id generation.
//!
//! Ids are 22 printable ASCII characters: a random 12-character prefix
//! and a 10-character base62 counter advanced by a random step, so ids
//! are unique within a process and collide across processes only if two
//! prefixes match.

use std::sync::Mutex;

use rand::Rng;

pub const ID_LEN: usize = 22;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
const BASE: u64 = 62;
const MAX_SEQ: u64 = BASE.pow(SEQ_LEN as u32);
const MIN_STEP: u64 = 33;
const MAX_STEP: u64 = 333;

pub struct IdGenerator {
    state: Mutex<State>,
}

struct State {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    step: u64,
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        IdGenerator {
            state: Mutex::new(State::randomized()),
        }
    }

    pub fn next(&self) -> String {
        let mut state = self.state.lock().expect("id generator lock");

        state.seq += state.step;
        if state.seq >= MAX_SEQ {
            *state = State::randomized();
        }

        let mut id = [0u8; ID_LEN];
        id[..PREFIX_LEN].copy_from_slice(&state.prefix);

        let mut rem = state.seq;
        for slot in id[PREFIX_LEN..].iter_mut().rev() {
            *slot = ALPHABET[(rem % BASE) as usize];
            rem /= BASE;
        }

        String::from_utf8(id.to_vec()).expect("alphabet is ascii")
    }
}

impl Default for IdGenerator {
    fn default() -> IdGenerator {
        IdGenerator::new()
    }
}

impl State {
    fn randomized() -> State {
        let mut rng = rand::thread_rng();
        let mut prefix = [0u8; PREFIX_LEN];
        for slot in prefix.iter_mut() {
            *slot = ALPHABET[rng.gen_range(0..ALPHABET.len())];
        }
        State {
            prefix,
            seq: rng.gen_range(0..MAX_SEQ / 2),
            step: rng.gen_range(MIN_STEP..MAX_STEP),
        }
    }
}
