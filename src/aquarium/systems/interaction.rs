use hashbrown::HashMap;
use rand::Rng;

use crate::aquarium::constants::{bubble, motion, sprite};
use crate::aquarium::state::{Bubble, CellPos, Fish, FishId, SessionId, TerminalCapability};
use crate::net::input::PointerEvent;
use crate::util::vec2::Vec2;

/// What a click did, for logging and tests
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClickOutcome {
    /// Not a left press
    Ignored,
    /// Left press that hit no fish
    Missed,
    /// Hit a fish owned by another session; nothing changed
    NotOwner(FishId),
    /// Hit one of the clicker's own fish
    Nudged { fish: FishId, angle: f32 },
}

/// Route a pointer event to the first fish under it.
///
/// Hit-testing uses the rendered rectangle, bob offset included. Only the
/// owner may nudge a fish; anyone else's click is dropped without effect.
pub fn handle_click<R: Rng>(
    fishes: &mut HashMap<FishId, Fish>,
    capability: &TerminalCapability,
    session: SessionId,
    event: PointerEvent,
    rng: &mut R,
) -> ClickOutcome {
    if !event.is_left_press() {
        return ClickOutcome::Ignored;
    }

    let point = capability.cell_origin(CellPos::new(event.col, event.row));
    let Some(fish) = fishes.values_mut().find(|f| f.hit_test(point)) else {
        return ClickOutcome::Missed;
    };

    if fish.owner != session {
        return ClickOutcome::NotOwner(fish.id);
    }

    let angle = motion::CLICK_TURN_ANGLES[rng.gen_range(0..motion::CLICK_TURN_ANGLES.len())];
    release_burst(fish, rng);
    fish.velocity = fish.velocity.rotate_degrees(angle);

    ClickOutcome::Nudged {
        fish: fish.id,
        angle,
    }
}

/// Staggered column of bubbles above the fish. The oldest bubbles give way
/// so a click always shows its full burst.
fn release_burst<R: Rng>(fish: &mut Fish, rng: &mut R) {
    fish.make_room(bubble::CLICK_BURST);
    for i in 0..bubble::CLICK_BURST {
        let jitter = (rng.gen::<f32>() - 0.5) * bubble::BURST_JITTER;
        let position = Vec2::new(
            fish.position.x + sprite::WIDTH / 2.0 + jitter,
            fish.position.y - bubble::SPAWN_LIFT - i as f32 * bubble::BURST_SPACING,
        );
        let glyph = Bubble::random_glyph(rng);
        fish.push_bubble(Bubble::new(position, glyph));
    }
}
