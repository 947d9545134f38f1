use cv_core::nalgebra::{Point3, Vector3};
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use std::io::Write;

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];

/// A camera glyph drawn into the exported cloud as five vertices: the
/// optical center and the corners of a small virtual image plane.
pub struct ExportCamera {
    pub optical_center: Point3<f64>,
    pub forward_direction: Vector3<f64>,
    pub up_direction: Vector3<f64>,
    pub focal_length: f64,
}

/// Writes the cloud (and optional camera glyphs) as an ASCII PLY file with
/// colored vertices.
pub fn export_ply(
    mut writer: impl Write,
    points_and_colors: impl IntoIterator<Item = (Point3<f64>, [u8; 3])>,
    cameras: &[ExportCamera],
) -> std::io::Result<()> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header.comments.push("Exported from cv-mvs".to_string());

    let mut vertex_element = ElementDef::new("vertex".to_string());
    for name in ["x", "y", "z"] {
        vertex_element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::Double),
        ));
    }
    for name in ["red", "green", "blue"] {
        vertex_element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::UChar),
        ));
    }
    ply.header.elements.add(vertex_element);

    let mut vertices: Vec<DefaultElement> = vec![];
    let mut add_vertex = |point: Point3<f64>, [r, g, b]: [u8; 3]| {
        let mut vertex = DefaultElement::new();
        vertex.insert("x".to_string(), Property::Double(point.x));
        vertex.insert("y".to_string(), Property::Double(point.y));
        vertex.insert("z".to_string(), Property::Double(point.z));
        vertex.insert("red".to_string(), Property::UChar(r));
        vertex.insert("green".to_string(), Property::UChar(g));
        vertex.insert("blue".to_string(), Property::UChar(b));
        vertices.push(vertex);
    };

    for camera in cameras {
        let right_direction = camera.forward_direction.cross(&camera.up_direction);
        add_vertex(camera.optical_center, CAMERA_COLOR);
        for (up, right) in [(1.0, 1.0), (1.0, -1.0), (-1.0, -1.0), (-1.0, 1.0)] {
            add_vertex(
                camera.optical_center
                    + (camera.forward_direction
                        + up * camera.up_direction
                        + right * right_direction)
                        * camera.focal_length,
                CAMERA_COLOR,
            );
        }
    }
    for (point, color) in points_and_colors {
        add_vertex(point, color);
    }

    ply.payload.insert("vertex".to_string(), vertices);

    let ply_writer = Writer::new();
    ply_writer.write_ply(&mut writer, &mut ply)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_points_and_camera_glyphs() {
        let cameras = [ExportCamera {
            optical_center: Point3::new(0.0, 0.0, 0.0),
            forward_direction: Vector3::z(),
            up_direction: -Vector3::y(),
            focal_length: 0.1,
        }];
        let mut out = vec![];
        export_ply(
            &mut out,
            vec![(Point3::new(1.0, 2.0, 3.0), [7, 8, 9])],
            &cameras,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("ply"));
        // One glyph (5 vertices) plus one cloud point.
        assert!(text.contains("element vertex 6"));
        assert!(text.contains("7 8 9"));
    }
}
