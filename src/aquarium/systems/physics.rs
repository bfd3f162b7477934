use hashbrown::HashMap;
use rand::Rng;
use rayon::prelude::*;

use crate::aquarium::constants::{bubble, motion, sprite};
use crate::aquarium::state::{Bounds, Bubble, Fish, FishId, TerminalCapability};
use crate::util::vec2::Vec2;

/// Advance every fish by `dt` seconds.
/// Fish are independent of each other, so the sweep runs in parallel with
/// each rayon worker drawing from its own thread-local RNG.
pub fn update(fishes: &mut HashMap<FishId, Fish>, capability: &TerminalCapability, dt: f32) {
    let bounds = capability.bounds();
    fishes.par_values_mut().for_each(|fish| {
        step_fish(fish, bounds, dt, &mut rand::thread_rng());
    });
}

/// One physics step for a single fish, in fixed order:
/// integrate, reflect, bob, spawn bubble, rise bubbles.
pub fn step_fish<R: Rng>(fish: &mut Fish, bounds: Bounds, dt: f32, rng: &mut R) {
    fish.position += fish.velocity * dt;

    let (x, vx) = reflect(fish.position.x, fish.velocity.x, bounds.max_x);
    let (y, vy) = reflect(fish.position.y, fish.velocity.y, bounds.max_y);
    fish.position = Vec2::new(x, y);
    fish.velocity = Vec2::new(vx, vy);

    // Kept within one cycle so long-lived fish never lose f32 precision
    fish.bob_phase = (fish.bob_phase + motion::BOB_FREQUENCY * dt).rem_euclid(motion::BOB_STEPS as f32);

    if rng.gen::<f32>() < bubble::SPAWN_RATE * dt {
        let origin = Vec2::new(
            fish.position.x + sprite::WIDTH / 2.0,
            fish.position.y - bubble::SPAWN_LIFT,
        );
        let glyph = Bubble::random_glyph(rng);
        fish.push_bubble(Bubble::new(origin, glyph));
    }

    rise_bubbles(fish, dt);
}

/// Elastic reflection on `[0, max]`: the velocity component is pointed back
/// inside and the position lands exactly on the boundary.
fn reflect(position: f32, velocity: f32, max: f32) -> (f32, f32) {
    if position > max {
        (max, -velocity.abs())
    } else if position < 0.0 {
        (0.0, velocity.abs())
    } else {
        (position, velocity)
    }
}

/// Move bubbles up; expired ones leave their last drawn cell behind for clearing
fn rise_bubbles(fish: &mut Fish, dt: f32) {
    let rise = bubble::SPEED * dt;
    let cleared = &mut fish.cleared;
    fish.bubbles.retain(|b| {
        b.position.y -= rise;
        if b.position.y < 0.0 {
            if let Some(cell) = b.prev_cell {
                cleared.push(cell);
            }
            false
        } else {
            true
        }
    });
}
