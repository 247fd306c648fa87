use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use log::debug;

use crate::{Error, Result};

/// Triangle mesh as flat vertex attribute arrays. `normals` and `uvs` are either empty or
/// hold one entry per position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Checks that the indices form whole triangles over existing vertices.
    pub fn validate(&self) -> Result<()> {
        if self.indices.len() % 3 != 0 {
            return Err(Error::Ply(format!(
                "{} indices do not form whole triangles",
                self.indices.len()
            )));
        }
        if let Some(index) = self
            .indices
            .iter()
            .find(|&&i| i as usize >= self.positions.len())
        {
            return Err(Error::Ply(format!(
                "index {} out of range for {} vertices",
                index,
                self.positions.len()
            )));
        }
        if !self.normals.is_empty() && self.normals.len() != self.positions.len() {
            return Err(Error::Ply("normal count differs from vertex count".into()));
        }
        if !self.uvs.is_empty() && self.uvs.len() != self.positions.len() {
            return Err(Error::Ply("uv count differs from vertex count".into()));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mesh = Self::from_reader(BufReader::new(file))
            .map_err(|e| match e {
                Error::Ply(message) => Error::Ply(format!("{}: {}", path.display(), message)),
                e => e,
            })?;
        debug!(
            "loaded {}: {} vertices, {} triangles",
            path.display(),
            mesh.vertex_count(),
            mesh.triangle_count()
        );
        Ok(mesh)
    }

    /// Parses an ASCII or binary PLY stream. Quads are split into two triangles sharing the
    /// 0-2 diagonal and appended after the file's triangles.
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<Self> {
        let header = Header::parse(&mut reader)?;
        let vertex = header
            .element("vertex")
            .ok_or_else(|| Error::Ply("no vertex element".into()))?;
        let face = header
            .element("face")
            .ok_or_else(|| Error::Ply("no face element".into()))?;
        if vertex.count == 0 || face.count == 0 {
            return Err(Error::Ply("no face or vertex data".into()));
        }
        if face.property("face_indices").is_some() {
            return Err(Error::Ply("face_indices is not supported".into()));
        }
        if !matches!(face.property("vertex_indices"), Some(Property::List { .. })) {
            return Err(Error::Ply("face element has no vertex_indices list".into()));
        }
        for axis in ["x", "y", "z"] {
            if vertex.property(axis).is_none() {
                return Err(Error::Ply(format!("vertex element has no {} property", axis)));
            }
        }

        let mut builder = MeshBuilder::new(vertex, face);
        match header.format {
            Format::Ascii => {
                let mut body = String::new();
                reader
                    .read_to_string(&mut body)
                    .map_err(|e| Error::Ply(format!("unreadable body: {}", e)))?;
                let mut values = AsciiValues {
                    tokens: body.split_ascii_whitespace(),
                };
                builder.read(&header, &mut values)?;
            }
            Format::BinaryLittleEndian => {
                let mut values = BinaryValues::<_, LittleEndian>::new(reader);
                builder.read(&header, &mut values)?;
            }
            Format::BinaryBigEndian => {
                let mut values = BinaryValues::<_, BigEndian>::new(reader);
                builder.read(&header, &mut values)?;
            }
        }
        let mesh = builder.finish();
        mesh.validate()?;
        Ok(mesh)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ScalarType {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "char" | "int8" => Self::I8,
            "uchar" | "uint8" => Self::U8,
            "short" | "int16" => Self::I16,
            "ushort" | "uint16" => Self::U16,
            "int" | "int32" => Self::I32,
            "uint" | "uint32" => Self::U32,
            "float" | "float32" => Self::F32,
            "double" | "float64" => Self::F64,
            other => return Err(Error::Ply(format!("unknown property type {}", other))),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Property {
    Scalar {
        name: String,
        ty: ScalarType,
    },
    List {
        name: String,
        count: ScalarType,
        item: ScalarType,
    },
}

impl Property {
    fn name(&self) -> &str {
        match self {
            Property::Scalar { name, .. } | Property::List { name, .. } => name,
        }
    }
}

#[derive(Clone, Debug)]
struct Element {
    name: String,
    count: usize,
    properties: Vec<Property>,
}

impl Element {
    fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name() == name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name() == name)
    }
}

struct Header {
    format: Format,
    elements: Vec<Element>,
}

impl Header {
    fn parse<R: BufRead>(reader: &mut R) -> Result<Self> {
        let mut line = String::new();
        let mut read_line = |line: &mut String| -> Result<()> {
            line.clear();
            let read = reader
                .read_line(line)
                .map_err(|e| Error::Ply(format!("unreadable header: {}", e)))?;
            if read == 0 {
                return Err(Error::Ply("header ends before end_header".into()));
            }
            Ok(())
        };

        read_line(&mut line)?;
        if line.trim() != "ply" {
            return Err(Error::Ply("missing ply magic".into()));
        }

        let mut format = None;
        let mut elements: Vec<Element> = Vec::new();
        loop {
            read_line(&mut line)?;
            let words: Vec<&str> = line.split_ascii_whitespace().collect();
            match words.as_slice() {
                [] | ["comment", ..] | ["obj_info", ..] => {}
                ["format", kind, _version] => {
                    format = Some(match *kind {
                        "ascii" => Format::Ascii,
                        "binary_little_endian" => Format::BinaryLittleEndian,
                        "binary_big_endian" => Format::BinaryBigEndian,
                        other => return Err(Error::Ply(format!("unknown format {}", other))),
                    })
                }
                ["element", name, count] => elements.push(Element {
                    name: name.to_string(),
                    count: count
                        .parse()
                        .map_err(|_| Error::Ply(format!("bad element count {}", count)))?,
                    properties: Vec::new(),
                }),
                ["property", "list", count, item, name] => elements
                    .last_mut()
                    .ok_or_else(|| Error::Ply("property before element".into()))?
                    .properties
                    .push(Property::List {
                        name: name.to_string(),
                        count: ScalarType::parse(count)?,
                        item: ScalarType::parse(item)?,
                    }),
                ["property", ty, name] => elements
                    .last_mut()
                    .ok_or_else(|| Error::Ply("property before element".into()))?
                    .properties
                    .push(Property::Scalar {
                        name: name.to_string(),
                        ty: ScalarType::parse(ty)?,
                    }),
                ["end_header"] => break,
                _ => return Err(Error::Ply(format!("unexpected header line {:?}", line.trim()))),
            }
        }

        Ok(Self {
            format: format.ok_or_else(|| Error::Ply("missing format line".into()))?,
            elements,
        })
    }

    fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }
}

trait ValueSource {
    fn next(&mut self, ty: ScalarType) -> Result<f64>;
}

struct AsciiValues<'a> {
    tokens: std::str::SplitAsciiWhitespace<'a>,
}

impl ValueSource for AsciiValues<'_> {
    fn next(&mut self, _ty: ScalarType) -> Result<f64> {
        let token = self
            .tokens
            .next()
            .ok_or_else(|| Error::Ply("unexpected end of data".into()))?;
        token
            .parse()
            .map_err(|_| Error::Ply(format!("bad number {}", token)))
    }
}

struct BinaryValues<R, B> {
    reader: R,
    _order: std::marker::PhantomData<B>,
}

impl<R: Read, B: ByteOrder> BinaryValues<R, B> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            _order: std::marker::PhantomData,
        }
    }
}

impl<R: Read, B: ByteOrder> ValueSource for BinaryValues<R, B> {
    fn next(&mut self, ty: ScalarType) -> Result<f64> {
        let r = &mut self.reader;
        let value = match ty {
            ScalarType::I8 => r.read_i8().map(f64::from),
            ScalarType::U8 => r.read_u8().map(f64::from),
            ScalarType::I16 => r.read_i16::<B>().map(f64::from),
            ScalarType::U16 => r.read_u16::<B>().map(f64::from),
            ScalarType::I32 => r.read_i32::<B>().map(f64::from),
            ScalarType::U32 => r.read_u32::<B>().map(f64::from),
            ScalarType::F32 => r.read_f32::<B>().map(f64::from),
            ScalarType::F64 => r.read_f64::<B>(),
        };
        value.map_err(|_| Error::Ply("unexpected end of data".into()))
    }
}

/// Largest element count reserved up front; bigger bodies grow as they are read.
const MAX_RESERVED: usize = 1 << 20;

/// Converts a list length or vertex index to an integer, rejecting negative, fractional and
/// oversized values.
fn whole_u32(value: f64, what: &str) -> Result<u32> {
    if value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(Error::Ply(format!("invalid {} {}", what, value)));
    }
    Ok(value as u32)
}

/// Column of each attribute inside the vertex element.
struct VertexColumns {
    position: [usize; 3],
    normal: Option<[usize; 3]>,
    uv: Option<[usize; 2]>,
}

struct MeshBuilder {
    columns: VertexColumns,
    indices_column: usize,
    mesh: Mesh,
    quads: Vec<[u32; 4]>,
}

impl MeshBuilder {
    fn new(vertex: &Element, face: &Element) -> Self {
        let find3 = |names: [&str; 3]| -> Option<[usize; 3]> {
            Some([
                vertex.position(names[0])?,
                vertex.position(names[1])?,
                vertex.position(names[2])?,
            ])
        };
        let find2 = |names: [&str; 2]| -> Option<[usize; 2]> {
            Some([vertex.position(names[0])?, vertex.position(names[1])?])
        };
        let columns = VertexColumns {
            position: find3(["x", "y", "z"]).unwrap_or([0, 1, 2]),
            normal: find3(["nx", "ny", "nz"]),
            uv: find2(["u", "v"])
                .or_else(|| find2(["s", "t"]))
                .or_else(|| find2(["texture_u", "texture_v"])),
        };
        Self {
            columns,
            indices_column: face.position("vertex_indices").unwrap_or(0),
            mesh: Mesh {
                positions: Vec::with_capacity(vertex.count.min(MAX_RESERVED)),
                normals: Vec::new(),
                uvs: Vec::new(),
                indices: Vec::with_capacity(face.count.saturating_mul(3).min(MAX_RESERVED)),
            },
            quads: Vec::new(),
        }
    }

    fn read<S: ValueSource>(&mut self, header: &Header, values: &mut S) -> Result<()> {
        let mut row: Vec<f64> = Vec::new();
        let mut list: Vec<u32> = Vec::new();
        for element in &header.elements {
            for _ in 0..element.count {
                row.clear();
                for (column, property) in element.properties.iter().enumerate() {
                    match property {
                        Property::Scalar { ty, .. } => row.push(values.next(*ty)?),
                        Property::List { count, item, .. } => {
                            let length = whole_u32(values.next(*count)?, "list length")?;
                            let keep = element.name == "face" && column == self.indices_column;
                            list.clear();
                            for _ in 0..length {
                                let value = values.next(*item)?;
                                if keep {
                                    list.push(whole_u32(value, "vertex index")?);
                                }
                            }
                            if keep {
                                self.push_face(&list)?;
                            }
                            row.push(0.0);
                        }
                    }
                }
                if element.name == "vertex" {
                    self.push_vertex(&row);
                }
            }
        }
        Ok(())
    }

    fn push_vertex(&mut self, row: &[f64]) {
        let [x, y, z] = self.columns.position;
        self.mesh
            .positions
            .push([row[x] as f32, row[y] as f32, row[z] as f32]);
        if let Some([x, y, z]) = self.columns.normal {
            self.mesh
                .normals
                .push([row[x] as f32, row[y] as f32, row[z] as f32]);
        }
        if let Some([u, v]) = self.columns.uv {
            self.mesh.uvs.push([row[u] as f32, row[v] as f32]);
        }
    }

    fn push_face(&mut self, face: &[u32]) -> Result<()> {
        match *face {
            [a, b, c] => self.mesh.indices.extend_from_slice(&[a, b, c]),
            [a, b, c, d] => self.quads.push([a, b, c, d]),
            _ => {
                return Err(Error::Ply(format!(
                    "face with {} vertices; only triangles and quads are supported",
                    face.len()
                )))
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Mesh {
        for [a, b, c, d] in self.quads {
            self.mesh.indices.extend_from_slice(&[a, b, c, a, c, d]);
        }
        self.mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const QUAD_AND_TRIANGLE: &str = "ply
format ascii 1.0
comment two faces
element vertex 5
property float x
property float y
property float z
property float nx
property float ny
property float nz
property float u
property float v
element face 2
property list uchar int vertex_indices
end_header
0 0 0 0 0 1 0 0
1 0 0 0 0 1 1 0
1 1 0 0 0 1 1 1
0 1 0 0 0 1 0 1
2 2 0 0 0 1 0.5 0.5
4 0 1 2 3
3 1 4 2
";

    #[test]
    fn quads_are_split_after_triangles() {
        let mesh = Mesh::from_reader(Cursor::new(QUAD_AND_TRIANGLE)).unwrap();
        assert_eq!(mesh.vertex_count(), 5);
        assert_eq!(mesh.indices, vec![1, 4, 2, 0, 1, 2, 0, 2, 3]);
        assert_eq!(mesh.normals.len(), 5);
        assert_eq!(mesh.uvs[2], [1.0, 1.0]);
        assert_eq!(mesh.positions[4], [2.0, 2.0, 0.0]);
    }

    #[test]
    fn every_index_is_in_range_and_triangles_are_whole() {
        let mesh = Mesh::from_reader(Cursor::new(QUAD_AND_TRIANGLE)).unwrap();
        assert_eq!(mesh.index_count() % 3, 0);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertex_count()));
    }

    #[test]
    fn pentagons_are_rejected() {
        let source = "ply
format ascii 1.0
element vertex 5
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
end_header
0 0 0
1 0 0
1 1 0
0 1 0
0 2 0
5 0 1 2 3 4
";
        let err = Mesh::from_reader(Cursor::new(source)).unwrap_err();
        assert!(err.to_string().contains("only triangles and quads"));
    }

    fn single_face(face: &str) -> String {
        format!(
            "ply
format ascii 1.0
element vertex 3
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
end_header
0 0 0
1 0 0
1 1 0
{}
",
            face
        )
    }

    #[test]
    fn negative_indices_are_rejected() {
        let err = Mesh::from_reader(Cursor::new(single_face("3 0 1 -1"))).unwrap_err();
        assert!(matches!(err, Error::Ply(_)));
        assert!(err.to_string().contains("vertex index"));
    }

    #[test]
    fn fractional_indices_are_rejected() {
        let source = single_face("3 0 1 1.5").replace("uchar int", "uchar float");
        let err = Mesh::from_reader(Cursor::new(source)).unwrap_err();
        assert!(matches!(err, Error::Ply(_)));
    }

    #[test]
    fn whole_numbers_convert_and_others_do_not() {
        assert_eq!(whole_u32(2.0, "index").unwrap(), 2);
        assert_eq!(whole_u32(u32::MAX as f64, "index").unwrap(), u32::MAX);
        assert!(whole_u32(-1.0, "index").is_err());
        assert!(whole_u32(0.25, "index").is_err());
        assert!(whole_u32(u32::MAX as f64 + 1.0, "index").is_err());
    }

    #[test]
    fn huge_header_counts_fail_without_reserving() {
        let source = "ply
format ascii 1.0
element vertex 18446744073709551615
property float x
property float y
property float z
element face 18446744073709551615
property list uchar int vertex_indices
end_header
0 0 0
1 0 0
1 1 0
3 0 1 2
";
        let err = Mesh::from_reader(Cursor::new(source)).unwrap_err();
        assert!(matches!(err, Error::Ply(_)));
    }

    #[test]
    fn face_indices_property_is_rejected() {
        let source = "ply
format ascii 1.0
element vertex 3
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
property list uchar int face_indices
end_header
0 0 0
1 0 0
1 1 0
3 0 1 2 1 0
";
        let err = Mesh::from_reader(Cursor::new(source)).unwrap_err();
        assert!(err.to_string().contains("face_indices"));
    }

    #[test]
    fn missing_faces_are_rejected() {
        let source = "ply
format ascii 1.0
element vertex 1
property float x
property float y
property float z
end_header
0 0 0
";
        assert!(Mesh::from_reader(Cursor::new(source)).is_err());
    }

    #[test]
    fn out_of_range_index_fails_validation() {
        let source = "ply
format ascii 1.0
element vertex 3
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
end_header
0 0 0
1 0 0
1 1 0
3 0 1 7
";
        let err = Mesh::from_reader(Cursor::new(source)).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn binary_little_endian_with_st_coordinates() {
        let header = "ply
format binary_little_endian 1.0
element vertex 3
property float x
property float y
property float z
property float s
property float t
element face 1
property list uchar uint vertex_indices
end_header
";
        let mut bytes = header.as_bytes().to_vec();
        let vertices: [[f32; 5]; 3] = [
            [0.0, 0.0, 0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 1.0, 0.0],
            [0.0, 1.0, 0.0, 0.0, 1.0],
        ];
        for vertex in vertices {
            for value in vertex {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        bytes.push(3);
        for index in [0u32, 1, 2] {
            bytes.extend_from_slice(&index.to_le_bytes());
        }

        let mesh = Mesh::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.uvs, vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        assert!(mesh.normals.is_empty());
    }

    #[test]
    fn truncated_binary_body_is_an_error() {
        let source = "ply
format binary_little_endian 1.0
element vertex 3
property float x
property float y
property float z
element face 1
property list uchar uint vertex_indices
end_header
";
        let mut bytes = source.as_bytes().to_vec();
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        assert!(Mesh::from_reader(Cursor::new(bytes)).is_err());
    }
}
