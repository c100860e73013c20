pub mod arena;
pub mod skiplist;

use rand::Rng;

pub const MAX_LEVEL: usize = 12;

/// Height of a new node, in `1..=MAX_LEVEL`. Each extra level is taken
/// with probability 1/4.
fn rand_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_LEVEL && rng.gen_ratio(1, 4) {
        height += 1;
    }
    height
}
