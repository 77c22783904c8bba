//! Round-robin rotation across interfaces.
//!
//! A drain step serves exactly one frame from one interface. The group
//! cursor remembers where the last frame went so that consecutive steps
//! visit interfaces fairly instead of letting the lowest-numbered one with
//! traffic win every time.

/// Rotation state shared by all drain callers.
#[derive(Debug)]
pub struct InterfaceGroup {
    cursor: usize,
    count: usize,
}

impl InterfaceGroup {
    pub fn new(count: usize) -> Self {
        Self { cursor: 0, count }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Interface ids in the order this step should probe them: the one
    /// after the last served first, wrapping over all of them.
    pub fn order(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).map(move |i| (self.cursor + i) % self.count)
    }

    /// Record that `id` was just served; the next probe starts after it.
    pub fn served(&mut self, id: usize) {
        if self.count > 0 {
            self.cursor = (id + 1) % self.count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_starts_after_last_served() {
        let mut group = InterfaceGroup::new(3);
        assert_eq!(group.order().collect::<Vec<_>>(), [0, 1, 2]);
        group.served(0);
        assert_eq!(group.order().collect::<Vec<_>>(), [1, 2, 0]);
        group.served(2);
        assert_eq!(group.order().collect::<Vec<_>>(), [0, 1, 2]);
    }

    #[test]
    fn single_interface_rotation_is_stable() {
        let mut group = InterfaceGroup::new(1);
        group.served(0);
        assert_eq!(group.order().collect::<Vec<_>>(), [0]);
    }
}
