//! COCO class table.

pub const UNKNOWN_LABEL: &str = "unknown";

pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Label for a class index, `"unknown"` when out of range.
pub fn class_label(class_id: usize) -> &'static str {
    COCO_CLASSES.get(class_id).copied().unwrap_or(UNKNOWN_LABEL)
}

/// Reverse lookup, case-insensitive.
pub fn class_id_for(label: &str) -> Option<usize> {
    COCO_CLASSES.iter().position(|c| c.eq_ignore_ascii_case(label.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups() {
        assert_eq!(class_label(0), "person");
        assert_eq!(class_label(79), "toothbrush");
        assert_eq!(class_label(80), UNKNOWN_LABEL);
        assert_eq!(class_id_for("Car"), Some(2));
        assert_eq!(class_id_for("unicorn"), None);
    }
}
