//! The pointer walk: advancing the marker while reversing consumed pairs.
//!
//! Each consumed forward pair is overwritten, in place, with the pair that
//! undoes it, and the marker byte slides two positions forward; the datagram
//! length never changes. Reversal arguments come from the graph, reached
//! through the [`WalkContext`] seam so this module stays free of vertex
//! state.

use crate::{
    Key,
    error::{WireError, WireResult},
    gram::find_ptr,
    read_arg, write_pair,
};

/// Graph access a pointer walk needs from its caller.
///
/// Implementors track a current position (the vertex the packet is leaving
/// at each step) and move it along as the walk consumes tree hops. Movement
/// methods return `false` when the referenced vertex does not exist, which
/// fails the walk.
pub trait WalkContext {
    /// Indice of the current vertex within its parent's children.
    fn indice(&self) -> u16;

    /// The receive address the current vertex owns on its bus, when it is a
    /// bus vertex.
    fn bus_rx_addr(&self) -> Option<u16>;

    /// Move to the sibling at `indice`.
    fn to_sib(&mut self, indice: u16) -> bool;

    /// Move to the parent.
    fn to_parent(&mut self) -> bool;

    /// Move to the child at `indice`.
    fn to_child(&mut self, indice: u16) -> bool;
}

/// Advance the pointer marker by `steps` pairs, reversing each in place.
///
/// `ptr` is the marker's believed offset; if the byte there is not the
/// marker the datagram is re-scanned. Port and bus transmit pairs may only
/// be crossed by a single-step call. Returns the marker's new offset.
pub fn walk_ptr(
    gram: &mut [u8],
    ctx: &mut impl WalkContext,
    steps: usize,
    ptr: usize,
) -> WireResult<usize> {
    let mut ptr = match gram.get(ptr) {
        Some(&byte) if byte == Key::Ptr.byte() => ptr,
        _ => find_ptr(gram)?,
    };
    for _ in 0..steps {
        let Some(&key_byte) = gram.get(ptr + 1) else {
            return Err(WireError::UnexpectedEnd);
        };
        if gram.len() < ptr + 3 {
            return Err(WireError::UnexpectedEnd);
        }
        let arg = read_arg(gram, ptr + 1)?;
        match Key::from_byte(key_byte) {
            Some(Key::Sib) => {
                // stash the indice from whence it came before moving off it
                let tx_indice = ctx.indice();
                if !ctx.to_sib(arg) {
                    return Err(WireError::WalkOffGraph);
                }
                write_pair(gram, ptr, Key::Sib, tx_indice)?;
            }
            Some(Key::Parent) => {
                let tx_indice = ctx.indice();
                if !ctx.to_parent() {
                    return Err(WireError::WalkOffGraph);
                }
                write_pair(gram, ptr, Key::Child, tx_indice)?;
            }
            Some(Key::Child) => {
                if !ctx.to_child(arg) {
                    return Err(WireError::WalkOffGraph);
                }
                write_pair(gram, ptr, Key::Parent, 0)?;
            }
            Some(Key::Pfwd) => {
                if steps != 1 {
                    return Err(WireError::MultiStepLinkHop);
                }
                write_pair(gram, ptr, Key::Pfwd, 0)?;
            }
            Some(Key::Bfwd) => {
                if steps != 1 {
                    return Err(WireError::MultiStepLinkHop);
                }
                let own = ctx.bus_rx_addr().ok_or(WireError::NotABus)?;
                write_pair(gram, ptr, Key::Bfwd, own)?;
            }
            Some(Key::Bbrd) => {
                // broadcasts carry the originator's address in the reversal
                let own = ctx.bus_rx_addr().ok_or(WireError::NotABus)?;
                write_pair(gram, ptr, Key::Bbrd, own)?;
            }
            _ => return Err(WireError::StrayKey),
        }
        gram[ptr + 2] = Key::Ptr.byte();
        ptr += 2;
    }
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: usize = usize::MAX;

    struct Node {
        parent: usize,
        children: [usize; 4],
        num_children: usize,
        indice: u16,
        bus_addr: Option<u16>,
    }

    struct Ctx {
        nodes: [Node; 4],
        at: usize,
    }

    impl WalkContext for Ctx {
        fn indice(&self) -> u16 {
            self.nodes[self.at].indice
        }
        fn bus_rx_addr(&self) -> Option<u16> {
            self.nodes[self.at].bus_addr
        }
        fn to_sib(&mut self, indice: u16) -> bool {
            let parent = self.nodes[self.at].parent;
            if parent == NONE {
                return false;
            }
            let parent = &self.nodes[parent];
            if usize::from(indice) >= parent.num_children {
                return false;
            }
            self.at = parent.children[usize::from(indice)];
            true
        }
        fn to_parent(&mut self) -> bool {
            let parent = self.nodes[self.at].parent;
            if parent == NONE {
                return false;
            }
            self.at = parent;
            true
        }
        fn to_child(&mut self, indice: u16) -> bool {
            let node = &self.nodes[self.at];
            if usize::from(indice) >= node.num_children {
                return false;
            }
            self.at = node.children[usize::from(indice)];
            true
        }
    }

    /// Root (node 0) with children A (node 1, a bus at addr 5) and B (node 2).
    fn fixture(at: usize) -> Ctx {
        Ctx {
            nodes: [
                Node {
                    parent: NONE,
                    children: [1, 2, NONE, NONE],
                    num_children: 2,
                    indice: 0,
                    bus_addr: None,
                },
                Node {
                    parent: 0,
                    children: [NONE; 4],
                    num_children: 0,
                    indice: 0,
                    bus_addr: Some(5),
                },
                Node {
                    parent: 0,
                    children: [NONE; 4],
                    num_children: 0,
                    indice: 1,
                    bus_addr: None,
                },
                Node {
                    parent: NONE,
                    children: [NONE; 4],
                    num_children: 0,
                    indice: 0,
                    bus_addr: None,
                },
            ],
            at,
        }
    }

    #[test]
    fn test_sib_step_reverses_to_source_indice() {
        // at A (indice 0), forward plan sib(1): reversal stashes 0
        let mut gram = [232, 3, 128, 0, 0xF0, 0x10, 0x01, 0xE0, 0xC0, 9];
        let mut ctx = fixture(1);
        let ptr = walk_ptr(&mut gram, &mut ctx, 1, 4).unwrap();
        assert_eq!(ptr, 6);
        assert_eq!(&gram[4..8], &[0x10, 0x00, 0xF0, 0xE0]);
        assert_eq!(ctx.at, 2);
    }

    #[test]
    fn test_child_step_reverses_to_parent() {
        // at root, forward plan child(0)
        let mut gram = [232, 3, 128, 0, 0xF0, 0x30, 0x00, 0xE0, 0xC0, 3];
        let mut ctx = fixture(0);
        let ptr = walk_ptr(&mut gram, &mut ctx, 1, 4).unwrap();
        assert_eq!(ptr, 6);
        assert_eq!(&gram[4..8], &[0x20, 0x00, 0xF0, 0xE0]);
        assert_eq!(ctx.at, 1);
    }

    #[test]
    fn test_parent_step_reverses_to_child_indice() {
        // at B (indice 1), forward plan parent
        let mut gram = [232, 3, 128, 0, 0xF0, 0x20, 0x00, 0xE0, 0xC0, 3];
        let mut ctx = fixture(2);
        walk_ptr(&mut gram, &mut ctx, 1, 4).unwrap();
        assert_eq!(&gram[4..8], &[0x30, 0x01, 0xF0, 0xE0]);
        assert_eq!(ctx.at, 0);
    }

    #[test]
    fn test_two_tree_steps_reverse_in_place() {
        // at A: sib(1) then parent; length is conserved, trail reads back
        let mut gram = [232, 3, 128, 0, 0xF0, 0x10, 0x01, 0x20, 0x00, 0xE0, 0xC0, 1];
        let mut ctx = fixture(1);
        let ptr = walk_ptr(&mut gram, &mut ctx, 2, 4).unwrap();
        assert_eq!(ptr, 8);
        assert_eq!(&gram[4..10], &[0x10, 0x00, 0x30, 0x01, 0xF0, 0xE0]);
    }

    #[test]
    fn test_bfwd_stamps_own_bus_address() {
        let mut gram = [232, 3, 128, 0, 0xF0, 0x50, 0x0C, 0xE0, 0xC0, 2];
        let mut ctx = fixture(1);
        walk_ptr(&mut gram, &mut ctx, 1, 4).unwrap();
        assert_eq!(&gram[4..8], &[0x50, 0x05, 0xF0, 0xE0]);
    }

    #[test]
    fn test_bfwd_rejects_multi_step() {
        let mut gram = [
            232, 3, 128, 0, 0xF0, 0x50, 0x0C, 0x10, 0x01, 0xE0, 0xC0, 2,
        ];
        let mut ctx = fixture(1);
        assert_eq!(
            walk_ptr(&mut gram, &mut ctx, 2, 4),
            Err(WireError::MultiStepLinkHop)
        );
    }

    #[test]
    fn test_walk_off_graph_fails() {
        // at A, sib(7) does not exist
        let mut gram = [232, 3, 128, 0, 0xF0, 0x10, 0x07, 0xE0, 0xC0, 2];
        let mut ctx = fixture(1);
        assert_eq!(
            walk_ptr(&mut gram, &mut ctx, 1, 4),
            Err(WireError::WalkOffGraph)
        );
    }

    #[test]
    fn test_misplaced_ptr_is_refound() {
        let mut gram = [232, 3, 128, 0, 0xF0, 0x10, 0x01, 0xE0, 0xC0, 9];
        let mut ctx = fixture(1);
        // hand it a wrong offset; the walk rescans from the top
        let ptr = walk_ptr(&mut gram, &mut ctx, 1, 6).unwrap();
        assert_eq!(ptr, 6);
        assert_eq!(gram[6], 0xF0);
    }
}
