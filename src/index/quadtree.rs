use super::Location;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rectangle {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rectangle {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    pub fn intersects(&self, other: &Rectangle) -> bool {
        !(other.x >= self.x + self.width
            || other.x + other.width <= self.x
            || other.y >= self.y + self.height
            || other.y + other.height <= self.y)
    }
}

#[derive(Debug, Clone)]
pub struct SpatialPoint {
    pub x: f64,
    pub y: f64,
    pub value: String,
    pub location: Location,
}

/// Region quadtree over cell coordinates. Points outside the root bounds
/// are discarded on insert; nodes split into four equal quadrants once
/// their capacity is exceeded.
#[derive(Debug)]
pub struct QuadTree {
    bounds: Rectangle,
    capacity: usize,
    points: Vec<SpatialPoint>,
    children: Option<Box<[QuadTree; 4]>>,
}

impl QuadTree {
    pub fn new(bounds: Rectangle, capacity: usize) -> Self {
        Self {
            bounds,
            capacity,
            points: Vec::new(),
            children: None,
        }
    }

    pub fn insert(&mut self, point: SpatialPoint) {
        if !self.bounds.contains(point.x, point.y) {
            return;
        }

        if self.points.len() < self.capacity && self.children.is_none() {
            self.points.push(point);
            return;
        }

        if self.children.is_none() {
            self.subdivide();
        }

        if let Some(children) = self.children.as_mut() {
            for child in children.iter_mut() {
                if child.bounds.contains(point.x, point.y) {
                    child.insert(point);
                    return;
                }
            }
        }
    }

    pub fn query(&self, bounds: &Rectangle) -> Vec<SpatialPoint> {
        let mut result = Vec::new();
        self.query_into(bounds, &mut result);
        result
    }

    fn query_into(&self, bounds: &Rectangle, out: &mut Vec<SpatialPoint>) {
        if !self.bounds.intersects(bounds) {
            return;
        }

        for point in &self.points {
            if bounds.contains(point.x, point.y) {
                out.push(point.clone());
            }
        }

        if let Some(children) = self.children.as_ref() {
            for child in children.iter() {
                child.query_into(bounds, out);
            }
        }
    }

    /// Drop every point whose location fails the predicate.
    pub fn retain<F: Fn(&SpatialPoint) -> bool + Copy>(&mut self, keep: F) {
        self.points.retain(|p| keep(p));
        if let Some(children) = self.children.as_mut() {
            for child in children.iter_mut() {
                child.retain(keep);
            }
        }
    }

    pub fn remove_location(&mut self, location: &Location) {
        self.retain(|p| &p.location != location);
    }

    pub fn len(&self) -> usize {
        let mut count = self.points.len();
        if let Some(children) = self.children.as_ref() {
            for child in children.iter() {
                count += child.len();
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn subdivide(&mut self) {
        let half_w = self.bounds.width / 2.0;
        let half_h = self.bounds.height / 2.0;
        let Rectangle { x, y, .. } = self.bounds;

        self.children = Some(Box::new([
            QuadTree::new(Rectangle::new(x, y, half_w, half_h), self.capacity),
            QuadTree::new(Rectangle::new(x + half_w, y, half_w, half_h), self.capacity),
            QuadTree::new(Rectangle::new(x, y + half_h, half_w, half_h), self.capacity),
            QuadTree::new(
                Rectangle::new(x + half_w, y + half_h, half_w, half_h),
                self.capacity,
            ),
        ]));
    }
}
