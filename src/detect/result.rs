use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Axis-aligned box in pixel coordinates, `x1 < x2` and `y1 < y2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Integer pixel corners, truncated toward zero.
    pub fn to_pixels(&self) -> [i64; 4] {
        [
            self.x1 as i64,
            self.y1 as i64,
            self.x2 as i64,
            self.y2 as i64,
        ]
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x1.max(other.x1);
        let top = self.y1.max(other.y1);
        let right = self.x2.min(other.x2);
        let bottom = self.y2.min(other.y2);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Clamp to a `width` x `height` image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let w = width as f32;
        let h = height as f32;
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

/// One inference result for one box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub class: ObjectClass,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class: ObjectClass) -> Self {
        Self {
            bbox,
            confidence,
            class,
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Package,
    Unknown,
}

impl ObjectClass {
    /// Map a COCO-80 class index onto the coarse classes tracked here.
    pub fn from_coco_id(id: usize) -> Self {
        match id {
            0 => ObjectClass::Person,
            1..=8 => ObjectClass::Vehicle,
            14..=23 => ObjectClass::Animal,
            24 | 26 | 28 => ObjectClass::Package,
            _ => ObjectClass::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ObjectClass::Person => "Person",
            ObjectClass::Vehicle => "Vehicle",
            ObjectClass::Animal => "Animal",
            ObjectClass::Package => "Package",
            ObjectClass::Unknown => "Object",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ObjectClass {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "person" => Ok(ObjectClass::Person),
            "vehicle" => Ok(ObjectClass::Vehicle),
            "animal" => Ok(ObjectClass::Animal),
            "package" => Ok(ObjectClass::Package),
            other => Err(anyhow!("unknown object class '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_geometry() {
        let bbox = BoundingBox::new(100.0, 100.0, 180.0, 300.0);
        assert!(bbox.is_valid());
        assert_eq!(bbox.width(), 80.0);
        assert_eq!(bbox.height(), 200.0);
        assert_eq!(bbox.area(), 16_000.0);
        assert!(!BoundingBox::new(5.0, 5.0, 5.0, 9.0).is_valid());
        assert!(!BoundingBox::new(0.0, f32::NAN, 5.0, 9.0).is_valid());
    }

    #[test]
    fn bbox_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BoundingBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn coco_ids_map_to_classes() {
        assert_eq!(ObjectClass::from_coco_id(0), ObjectClass::Person);
        assert_eq!(ObjectClass::from_coco_id(2), ObjectClass::Vehicle);
        assert_eq!(ObjectClass::from_coco_id(16), ObjectClass::Animal);
        assert_eq!(ObjectClass::from_coco_id(28), ObjectClass::Package);
        assert_eq!(ObjectClass::from_coco_id(60), ObjectClass::Unknown);
        assert_eq!("Person".parse::<ObjectClass>().unwrap(), ObjectClass::Person);
        assert!("unicorn".parse::<ObjectClass>().is_err());
    }
}
