//! Trust Classification
//!
//! The merge and comparison rules driven by per-field trust metadata:
//!
//! | Class          | Server ingest          | Client prediction check             |
//! |----------------|------------------------|-------------------------------------|
//! | client-trusted | copied from commands   | skipped                             |
//! | server-only    | never read from client | pulled into latest prediction       |
//! | checked        | produced by the step   | compared (epsilon when tolerance)   |
//!
//! Single-tick fields are cleared after the step that consumed them.
//! Local-only fields never cross the wire and are ignored by every rule.

use crate::core::schema::{FieldId, Trust};
use crate::core::snapshot::{
    navigate_mut, navigate_zipped, navigate_zipped_mut, Navigation, SnapshotMut, SnapshotRef,
};

/// Server side: copy client-trusted fields from a command's player part.
pub fn merge_client_trusted(server_player: &mut SnapshotMut<'_>, commands_player: SnapshotRef<'_>) {
    navigate_zipped_mut(server_player, commands_player, |_, node, pair| {
        if node.meta.local_only {
            return Navigation::SkipSubtree;
        }
        match (node.meta.trust, pair) {
            (Trust::ClientTrusted, Some((server, client))) => server.copy_from(client),
            (Trust::ServerOnly, _) => return Navigation::SkipSubtree,
            _ => {}
        }
        Navigation::Continue
    });
}

/// Client side: pull every present server-only field into `latest`.
pub fn pull_server_only(latest: &mut SnapshotMut<'_>, server_player: SnapshotRef<'_>) {
    navigate_zipped_mut(latest, server_player, |_, node, pair| {
        if node.meta.local_only || node.meta.trust == Trust::ClientTrusted {
            return Navigation::SkipSubtree;
        }
        if let (Trust::ServerOnly, Some((local, server))) = (node.meta.trust, pair) {
            if server.is_present() {
                local.copy_from(server);
            }
        }
        Navigation::Continue
    });
}

/// Client side: the first field where a prediction disagrees with the
/// authoritative player, or `None` when the prediction holds.
///
/// Server-only, client-trusted and local-only subtrees are not compared.
/// Leaves with a tolerance compare within epsilon; all others exactly.
pub fn first_misprediction(predicted: SnapshotRef<'_>, server_player: SnapshotRef<'_>) -> Option<FieldId> {
    let mut mismatch = None;
    navigate_zipped(predicted, server_player, |id, node, pair| {
        if node.meta.local_only || node.meta.trust != Trust::Checked {
            return Navigation::SkipSubtree;
        }
        let Some((mine, theirs)) = pair else {
            return Navigation::Continue;
        };
        let same = match node.meta.tolerance {
            Some(epsilon) => mine.within(theirs, epsilon),
            None => mine.value_eq(theirs),
        };
        if same {
            Navigation::Continue
        } else {
            mismatch = Some(id);
            Navigation::Stop
        }
    });
    mismatch
}

/// Clear every single-tick leaf to absent.
pub fn clear_single_tick(view: &mut SnapshotMut<'_>) {
    navigate_mut(view, |_, node, field| {
        if let Some(field) = field {
            if node.meta.single_tick {
                field.clear();
            }
        }
        Navigation::Continue
    });
}

/// Server side: clear single-tick leaves and override flags in one pass.
pub fn end_of_tick(view: &mut SnapshotMut<'_>) {
    navigate_mut(view, |_, node, field| {
        if let Some(field) = field {
            if node.meta.single_tick {
                field.clear();
            }
            field.is_override = false;
        }
        Navigation::Continue
    });
}

/// Client side: apply a received snapshot onto a history slot.
///
/// A field is taken when it is single-tick or was not marked "same" by the
/// sender; local-only fields are kept.
pub fn apply_received(current: &mut SnapshotMut<'_>, received: SnapshotRef<'_>) {
    navigate_zipped_mut(current, received, |_, node, pair| {
        if node.meta.local_only {
            return Navigation::SkipSubtree;
        }
        if let Some((current, received)) = pair {
            if node.meta.single_tick || !received.was_same {
                current.copy_from(received);
            }
        }
        Navigation::Continue
    });
}

/// Client side: force-copy server-overridden fields into the outgoing
/// command's player part. Returns how many fields were copied.
pub fn copy_overrides(commands_player: &mut SnapshotMut<'_>, server_player: SnapshotRef<'_>) -> usize {
    let mut copied = 0;
    navigate_zipped_mut(commands_player, server_player, |_, node, pair| {
        if node.meta.local_only {
            return Navigation::SkipSubtree;
        }
        if let Some((command, server)) = pair {
            if server.is_override && server.is_present() {
                command.copy_from(server);
                copied += 1;
            }
        }
        Navigation::Continue
    });
    copied
}

/// Clear leaves that carry an override flag.
pub fn clear_overridden(view: &mut SnapshotMut<'_>) {
    navigate_mut(view, |_, _, field| {
        if let Some(field) = field {
            if field.is_override {
                field.clear();
            }
        }
        Navigation::Continue
    });
}
