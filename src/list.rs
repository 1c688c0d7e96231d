//! Intrusive doubly linked lists over elements named by stable ids.
//!
//! A [`List`] only stores head, tail and length. The links live wherever the
//! elements live (a side array for buddy chunks, the header of a pageblock),
//! reached through a [`Links`] arena. Every operation is O(1) except the
//! explicit walks.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link<I> {
  pub prev: Option<I>,
  pub next: Option<I>,
}

impl<I> Link<I> {
  pub const UNLINKED: Self = Self {
    prev: None,
    next: None,
  };
}

/// Storage holding the link of every element id.
pub trait Links<I: Copy + Eq> {
  fn link(&self, id: I) -> &Link<I>;
  fn link_mut(&mut self, id: I) -> &mut Link<I>;
}

impl Links<u16> for [Link<u16>] {
  #[inline]
  fn link(&self, id: u16) -> &Link<u16> {
    &self[id as usize]
  }

  #[inline]
  fn link_mut(&mut self, id: u16) -> &mut Link<u16> {
    &mut self[id as usize]
  }
}

#[derive(Debug)]
pub struct List<I> {
  head: Option<I>,
  tail: Option<I>,
  len: usize,
}

impl<I: Copy + Eq> List<I> {
  pub const fn new() -> Self {
    Self {
      head: None,
      tail: None,
      len: 0,
    }
  }

  #[inline]
  pub fn head(&self) -> Option<I> {
    self.head
  }

  #[cfg(test)]
  pub fn tail(&self) -> Option<I> {
    self.tail
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  pub fn push_front<A: Links<I> + ?Sized>(&mut self, links: &mut A, id: I) {
    let old_head = self.head;
    *links.link_mut(id) = Link {
      prev: None,
      next: old_head,
    };
    match old_head {
      Some(head) => links.link_mut(head).prev = Some(id),
      None => self.tail = Some(id),
    }
    self.head = Some(id);
    self.len += 1;
  }

  pub fn push_back<A: Links<I> + ?Sized>(&mut self, links: &mut A, id: I) {
    let old_tail = self.tail;
    *links.link_mut(id) = Link {
      prev: old_tail,
      next: None,
    };
    match old_tail {
      Some(tail) => links.link_mut(tail).next = Some(id),
      None => self.head = Some(id),
    }
    self.tail = Some(id);
    self.len += 1;
  }

  /// Unlinks `id`, which must be on this list.
  pub fn remove<A: Links<I> + ?Sized>(&mut self, links: &mut A, id: I) {
    let Link { prev, next } = *links.link(id);
    match prev {
      Some(prev) => links.link_mut(prev).next = next,
      None => self.head = next,
    }
    match next {
      Some(next) => links.link_mut(next).prev = prev,
      None => self.tail = prev,
    }
    *links.link_mut(id) = Link::UNLINKED;
    self.len -= 1;
  }

  pub fn pop_front<A: Links<I> + ?Sized>(&mut self, links: &mut A) -> Option<I> {
    let head = self.head?;
    self.remove(links, head);
    Some(head)
  }

  /// Moves the head to the back.
  pub fn rotate<A: Links<I> + ?Sized>(&mut self, links: &mut A) {
    if self.head == self.tail {
      return;
    }
    if let Some(head) = self.pop_front(links) {
      self.push_back(links, head);
    }
  }

  /// Moves `id` (already on this list) to the front.
  pub fn move_to_front<A: Links<I> + ?Sized>(&mut self, links: &mut A, id: I) {
    if self.head != Some(id) {
      self.remove(links, id);
      self.push_front(links, id);
    }
  }

  /// Element after `id`.
  #[inline]
  pub fn next<A: Links<I> + ?Sized>(&self, links: &A, id: I) -> Option<I> {
    links.link(id).next
  }
}

impl<I: Copy + Eq> Default for List<I> {
  fn default() -> Self {
    Self::new()
  }
}
