//! Depth-first traversal of every page of an index.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use super::handle::LatchMode;
use super::page::{PageRef, PageType};
use super::tree::BlinkTree;
use crate::types::{BlinkError, PageId, Result};

/// Callbacks invoked for each page reached by [`BlinkTree::walk`].
pub trait PageVisitor {
    /// Called for each branch page, before its children.
    fn visit_branch(&mut self, page: PageId, view: &PageRef<'_>) -> Result<()>;
    /// Called for each leaf page, in key order.
    fn visit_leaf(&mut self, page: PageId, view: &PageRef<'_>) -> Result<()>;
    /// Called when a separator or right link of `from` names a page that has
    /// been released. Nothing below `page` is visited.
    fn visit_released(&mut self, from: PageId, page: PageId) -> Result<()> {
        let _ = (from, page);
        Ok(())
    }
}

/// A page to visit, the page whose separator or right link named it, and the
/// page its level should continue with afterwards. A right link naming
/// anything else leads to a sibling whose separator has not reached the
/// parent yet, which is visited next.
type Pending = (PageId, PageId, Option<PageId>);

impl BlinkTree {
    /// Visits every page of the index at `root` in pre-order, children left
    /// to right. Only one page is latched at a time beyond a brief peek at a
    /// parent's right sibling.
    pub fn walk(&self, root: PageId, visitor: &mut dyn PageVisitor) -> Result<()> {
        let mut stack: SmallVec<[Pending; 32]> = SmallVec::new();
        let mut seen: FxHashSet<PageId> = FxHashSet::default();
        stack.push((root, root, None));
        while let Some((id, from, boundary)) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let page = if id == root {
                self.latch_root(root, LatchMode::S)?
            } else {
                match self.enter(id, root, LatchMode::S)? {
                    Some(page) => page,
                    None => {
                        visitor.visit_released(from, id)?;
                        continue;
                    }
                }
            };
            let header = page.header()?;
            let view = page.view();
            if let Some(next) = header.next {
                if Some(next) != boundary {
                    stack.push((next, id, boundary));
                }
            }
            match header.page_type {
                PageType::Leaf => visitor.visit_leaf(id, &view)?,
                PageType::Branch => {
                    visitor.visit_branch(id, &view)?;
                    let children = view.children()?;
                    let last_boundary = match header.next {
                        Some(next) => self.first_child(next, root)?,
                        None => None,
                    };
                    let mut follow = last_boundary;
                    for child in children.iter().rev() {
                        stack.push((*child, id, follow));
                        follow = Some(*child);
                    }
                }
                PageType::Free => return Err(BlinkError::Corruption("walk reached a free page")),
            }
        }
        Ok(())
    }

    fn first_child(&self, id: PageId, root: PageId) -> Result<Option<PageId>> {
        Ok(match self.enter(id, root, LatchMode::S)? {
            Some(page) => page.header()?.before,
            None => None,
        })
    }
}
