//! 图谱二进制格式的编码与解码. 所有数值均为大端.

use std::io::{self, Read, Write};

use byteordered::{ByteOrdered, Endianness};
use ndarray::Array3;

use crate::consts::tags::*;
use crate::consts::{flags, GcaType, GCA_VERSION, GIBBS_NEIGHBORS, MAX_GCA_LABELS};
use crate::gca::{Gc1d, Gca, GcaNode, GcaPrior, NeighborHistogram, PulseParams, TissueParms};
use crate::volume::VolumeGeometry;
use crate::{GcaError, GcaResult, Idx3d, Label};

type Reader<R> = ByteOrdered<R, Endianness>;
type Writer<W> = ByteOrdered<W, Endianness>;

/// 单元中标签个数的上限: 标签为单字节, 不会重复.
const MAX_CELL_LABELS: usize = Label::MAX as usize + 1;

/// 网格单元总数的上限, 防止损坏的文件触发巨量分配.
const MAX_GRID_CELLS: usize = 1 << 28;

#[inline]
fn malformed(msg: impl Into<String>) -> GcaError {
    GcaError::MalformedFile(msg.into())
}

#[inline]
fn to_i32(n: usize, what: &str) -> GcaResult<i32> {
    i32::try_from(n).map_err(|_| malformed(format!("{what} {n} does not fit in i32")))
}

fn read_count<R: Read>(r: &mut Reader<R>, what: &str, max: usize) -> GcaResult<usize> {
    let n = r.read_i32()?;
    match usize::try_from(n) {
        Ok(n) if n <= max => Ok(n),
        _ => Err(malformed(format!("{what} {n} out of range"))),
    }
}

fn read_dims<R: Read>(r: &mut Reader<R>) -> GcaResult<Idx3d> {
    let mut d = [0; 3];
    for v in d.iter_mut() {
        *v = read_count(r, "grid dimension", MAX_GRID_CELLS)?;
        if *v == 0 {
            return Err(malformed("grid dimension is zero"));
        }
    }
    let cells = d[0].checked_mul(d[1]).and_then(|v| v.checked_mul(d[2]));
    match cells {
        Some(n) if n <= MAX_GRID_CELLS => Ok((d[0], d[1], d[2])),
        _ => Err(malformed(format!("grid {d:?} too large"))),
    }
}

fn write_dims<W: Write>(w: &mut Writer<W>, (x, y, z): Idx3d) -> GcaResult<()> {
    for v in [x, y, z] {
        w.write_i32(to_i32(v, "grid dimension")?)?;
    }
    Ok(())
}

fn read_spacing<R: Read>(r: &mut Reader<R>) -> GcaResult<f64> {
    let s = r.read_f32()?;
    if !(s.is_finite() && s > 0.0) {
        return Err(malformed(format!("spacing {s} is not positive")));
    }
    Ok(s as f64)
}

fn read_floats<R: Read>(r: &mut Reader<R>, n: usize) -> io::Result<Vec<f32>> {
    (0..n).map(|_| r.read_f32()).collect()
}

/// 读取一个分类器, 不含标签字节 (以及旧格式中的先验).
fn read_gc<R: Read>(r: &mut Reader<R>, ninputs: usize, mrf: bool) -> GcaResult<Gc1d> {
    let mut gc = Gc1d::new(ninputs);
    gc.means = read_floats(r, ninputs)?;
    gc.covars = read_floats(r, ninputs * (ninputs + 1) / 2)?;
    if mrf {
        for nbr in gc.nbrs.iter_mut() {
            let n = read_count(r, "neighbor count", MAX_CELL_LABELS)?;
            let mut labels = Vec::with_capacity(n);
            let mut priors = Vec::with_capacity(n);
            for _ in 0..n {
                let l = r.read_i32()?;
                let l = Label::try_from(l).map_err(|_| malformed(format!("neighbor label {l}")))?;
                labels.push(l);
                priors.push(r.read_f32()?);
            }
            *nbr = NeighborHistogram::from_entries(labels, priors);
        }
    }
    Ok(gc)
}

fn write_gc<W: Write>(w: &mut Writer<W>, gc: &Gc1d, mrf: bool) -> GcaResult<()> {
    for v in gc.means.iter().chain(&gc.covars) {
        w.write_f32(*v)?;
    }
    if mrf {
        debug_assert_eq!(gc.nbrs.len(), GIBBS_NEIGHBORS);
        for nbr in &gc.nbrs {
            w.write_i32(to_i32(nbr.len(), "neighbor count")?)?;
            for (l, p) in nbr.iter() {
                w.write_i32(l as i32)?;
                w.write_f32(p)?;
            }
        }
    }
    Ok(())
}

fn read_total<R: Read>(r: &mut Reader<R>) -> GcaResult<u32> {
    let n = r.read_i32()?;
    u32::try_from(n).map_err(|_| malformed(format!("negative training count {n}")))
}

/// 扩展段中读到的内容.
#[derive(Default)]
struct Extensions {
    gca_type: Option<GcaType>,
    sequence: Vec<PulseParams>,
    geometry: Option<VolumeGeometry>,
    tissue: Vec<(Label, TissueParms)>,
}

fn read_tag_payload(ext: &mut Extensions, tag: i32, payload: &[u8]) -> GcaResult<()> {
    let mut p = ByteOrdered::runtime(payload, Endianness::Big);
    match tag {
        TAG_PARAMETERS => {
            let n = read_count(&mut p, "sequence length", MAX_GCA_LABELS)?;
            ext.sequence = (0..n)
                .map(|_| -> io::Result<PulseParams> {
                    Ok(PulseParams {
                        tr: p.read_f32()?,
                        flip_angle: p.read_f32()?,
                        te: p.read_f32()?,
                    })
                })
                .collect::<io::Result<_>>()?;
        }
        TAG_GCA_TYPE => {
            let code = p.read_i32()?;
            let t = GcaType::from_code(code).ok_or_else(|| malformed(format!("atlas type {code}")))?;
            ext.gca_type = Some(t);
        }
        TAG_GCA_DIRCOS => {
            let f = read_floats(&mut p, 12)?;
            let dims = read_dims(&mut p)?;
            let sizes = read_floats(&mut p, 3)?;
            if sizes.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                return Err(malformed(format!("voxel sizes {sizes:?}")));
            }
            let v = |i: usize| [f[i] as f64, f[i + 1] as f64, f[i + 2] as f64];
            let geometry = VolumeGeometry::new(dims, [sizes[0] as f64, sizes[1] as f64, sizes[2] as f64])
                .with_dircos(v(0), v(3), v(6))
                .with_center(v(9));
            ext.geometry = Some(geometry);
        }
        TAG_GCA_TISSUE_PARMS => {
            let n = read_count(&mut p, "tissue entries", MAX_GCA_LABELS)?;
            for _ in 0..n {
                let l = p.read_i32()?;
                let l = Label::try_from(l).map_err(|_| malformed(format!("tissue label {l}")))?;
                let tp = TissueParms {
                    t1: p.read_f32()?,
                    pd: p.read_f32()?,
                    t2: p.read_f32()?,
                };
                ext.tissue.push((l, tp));
            }
        }
        _ => log::warn!("unknown tag {tag} ({} bytes) skipped", payload.len()),
    }
    Ok(())
}

/// 读取扩展段直到文件结束.
fn read_tags<R: Read>(r: &mut Reader<R>) -> GcaResult<Extensions> {
    let mut ext = Extensions::default();
    loop {
        let tag = match r.read_i32() {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let nbytes = read_count(r, "tag length", i32::MAX as usize)?;
        let mut payload = Vec::new();
        let got = Read::take(&mut *r, nbytes as u64).read_to_end(&mut payload)?;
        if got != nbytes {
            return Err(malformed(format!("tag {tag} truncated: {got} of {nbytes} bytes")));
        }
        read_tag_payload(&mut ext, tag, &payload)?;
    }
    Ok(ext)
}

fn write_tag<W: Write>(
    w: &mut Writer<W>,
    tag: i32,
    body: impl FnOnce(&mut Writer<&mut Vec<u8>>) -> io::Result<()>,
) -> GcaResult<()> {
    let mut buf = Vec::new();
    body(&mut ByteOrdered::runtime(&mut buf, Endianness::Big))?;
    w.write_i32(tag)?;
    w.write_i32(to_i32(buf.len(), "tag length")?)?;
    w.write_all(&buf)?;
    Ok(())
}

fn write_tags<W: Write>(w: &mut Writer<W>, gca: &Gca) -> GcaResult<()> {
    write_tag(w, TAG_GCA_TYPE, |p| p.write_i32(gca.gca_type().code()))?;

    let seq = gca.sequence();
    if !seq.is_empty() {
        write_tag(w, TAG_PARAMETERS, |p| {
            p.write_i32(seq.len() as i32)?;
            for s in seq {
                p.write_f32(s.tr)?;
                p.write_f32(s.flip_angle)?;
                p.write_f32(s.te)?;
            }
            Ok(())
        })?;
    }

    let g = gca.geometry();
    let (gw, gh, gd) = g.dims();
    let dims = [to_i32(gw, "width")?, to_i32(gh, "height")?, to_i32(gd, "depth")?];
    write_tag(w, TAG_GCA_DIRCOS, |p| {
        for v in g.dircos().iter().chain(std::iter::once(&g.center())).flatten() {
            p.write_f32(*v as f32)?;
        }
        for v in dims {
            p.write_i32(v)?;
        }
        for v in g.sizes() {
            p.write_f32(v as f32)?;
        }
        Ok(())
    })?;

    let tissue: Vec<(usize, &TissueParms)> = gca
        .tissue_table()
        .iter()
        .enumerate()
        .filter(|(_, tp)| !tp.is_unset())
        .collect();
    if !tissue.is_empty() {
        write_tag(w, TAG_GCA_TISSUE_PARMS, |p| {
            p.write_i32(tissue.len() as i32)?;
            for (l, tp) in &tissue {
                p.write_i32(*l as i32)?;
                p.write_f32(tp.t1)?;
                p.write_f32(tp.pd)?;
                p.write_f32(tp.t2)?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// 没有几何扩展段时, 由 node 网格推出模板几何 (1mm 各向同性).
fn default_geometry((w, h, d): Idx3d, spacing: f64) -> VolumeGeometry {
    let len = |n: usize| ((n as f64 * spacing).round() as usize).max(1);
    VolumeGeometry::isotropic((len(w), len(h), len(d)))
}

fn assemble(
    ninputs: usize,
    prior_spacing: f64,
    node_spacing: f64,
    nodes: Array3<GcaNode>,
    priors: Array3<GcaPrior>,
    flags: u32,
    ext: Extensions,
) -> Gca {
    let geometry = ext
        .geometry
        .unwrap_or_else(|| default_geometry(nodes.dim(), node_spacing));
    let mut gca = Gca::from_parts(ninputs, prior_spacing, node_spacing, nodes, priors, flags, geometry);
    gca.set_gca_type(ext.gca_type.unwrap_or_default());
    gca.set_sequence(ext.sequence);
    for (l, tp) in ext.tissue {
        gca.set_tissue_parms(l, tp);
    }
    gca
}

fn read_header_flags<R: Read>(r: &mut Reader<R>) -> GcaResult<(usize, u32)> {
    let ninputs = read_count(r, "ninputs", MAX_CELL_LABELS)?;
    if ninputs == 0 {
        return Err(malformed("ninputs is zero"));
    }
    let flags = r.read_i32()? as u32;
    Ok((ninputs, flags))
}

/// 当前版本的布局: prior 与 node 网格各自独立保存.
fn read_current<R: Read>(r: &mut Reader<R>) -> GcaResult<Gca> {
    let prior_spacing = read_spacing(r)?;
    let node_spacing = read_spacing(r)?;
    let prior_dims = read_dims(r)?;
    let node_dims = read_dims(r)?;
    let (ninputs, flags) = read_header_flags(r)?;
    let mrf = flags & flags::GCA_NO_MRF == 0;

    let node_cells = node_dims.0 * node_dims.1 * node_dims.2;
    let mut nodes = Vec::with_capacity(node_cells);
    for _ in 0..node_cells {
        let n = read_count(r, "node label count", MAX_CELL_LABELS)?;
        let total = read_total(r)?;
        let mut labels = Vec::with_capacity(n);
        let mut gcs = Vec::with_capacity(n);
        for _ in 0..n {
            labels.push(r.read_u8()?);
            gcs.push(read_gc(r, ninputs, mrf)?);
        }
        nodes.push(GcaNode::from_entries(labels, gcs, total));
    }

    let prior_cells = prior_dims.0 * prior_dims.1 * prior_dims.2;
    let mut priors = Vec::with_capacity(prior_cells);
    for _ in 0..prior_cells {
        let n = read_count(r, "prior label count", MAX_CELL_LABELS)?;
        let total = read_total(r)?;
        let mut labels = Vec::with_capacity(n);
        let mut ps = Vec::with_capacity(n);
        for _ in 0..n {
            labels.push(r.read_u8()?);
            ps.push(r.read_f32()?);
        }
        priors.push(GcaPrior::from_entries(labels, ps, total));
    }

    let nodes = Array3::from_shape_vec(node_dims, nodes).map_err(|e| malformed(e.to_string()))?;
    let priors = Array3::from_shape_vec(prior_dims, priors).map_err(|e| malformed(e.to_string()))?;
    let ext = read_tags(r)?;
    Ok(assemble(ninputs, prior_spacing, node_spacing, nodes, priors, flags, ext))
}

/// 旧版本布局: 单一间距, 只有 node 网格, 每个标签的先验紧跟在标签字节之后.
/// prior 网格按 node 间距重建.
fn read_legacy<R: Read>(r: &mut Reader<R>) -> GcaResult<Gca> {
    let spacing = read_spacing(r)?;
    let dims = read_dims(r)?;
    let (ninputs, flags) = read_header_flags(r)?;
    let mrf = flags & flags::GCA_NO_MRF == 0;

    let cells = dims.0 * dims.1 * dims.2;
    let mut nodes = Vec::with_capacity(cells);
    let mut priors = Vec::with_capacity(cells);
    for _ in 0..cells {
        let n = read_count(r, "node label count", MAX_CELL_LABELS)?;
        let total = read_total(r)?;
        let mut labels = Vec::with_capacity(n);
        let mut ps = Vec::with_capacity(n);
        let mut gcs = Vec::with_capacity(n);
        for _ in 0..n {
            labels.push(r.read_u8()?);
            ps.push(r.read_f32()?);
            gcs.push(read_gc(r, ninputs, mrf)?);
        }
        priors.push(GcaPrior::from_entries(labels.clone(), ps, total));
        nodes.push(GcaNode::from_entries(labels, gcs, total));
    }

    let nodes = Array3::from_shape_vec(dims, nodes).map_err(|e| malformed(e.to_string()))?;
    let priors = Array3::from_shape_vec(dims, priors).map_err(|e| malformed(e.to_string()))?;
    let ext = read_tags(r)?;
    Ok(assemble(ninputs, spacing, spacing, nodes, priors, flags, ext))
}

/// 从字节流解码图谱.
pub(super) fn read_gca<R: Read>(input: R) -> GcaResult<Gca> {
    let mut r = ByteOrdered::runtime(input, Endianness::Big);
    let version = r.read_f32()?;
    if !version.is_finite() {
        return Err(malformed(format!("version {version}")));
    }
    if version > GCA_VERSION {
        return Err(GcaError::UnsupportedVersion(version));
    }
    if version == GCA_VERSION {
        read_current(&mut r)
    } else {
        log::info!("reading legacy atlas format, version {version}");
        read_legacy(&mut r)
    }
}

/// 以当前版本编码图谱.
pub(super) fn write_gca<W: Write>(gca: &Gca, output: W) -> GcaResult<()> {
    let mut w = ByteOrdered::runtime(output, Endianness::Big);
    let mrf = gca.uses_mrf();
    w.write_f32(GCA_VERSION)?;
    w.write_f32(gca.prior_spacing() as f32)?;
    w.write_f32(gca.node_spacing() as f32)?;
    write_dims(&mut w, gca.prior_dims())?;
    write_dims(&mut w, gca.node_dims())?;
    w.write_i32(to_i32(gca.ninputs(), "ninputs")?)?;
    w.write_i32(gca.flags() as i32)?;

    for node in gca.nodes().iter() {
        w.write_i32(to_i32(node.len(), "node label count")?)?;
        w.write_i32(to_i32(node.total_training as usize, "training count")?)?;
        for (label, gc) in node.iter() {
            w.write_u8(label)?;
            write_gc(&mut w, gc, mrf)?;
        }
    }
    for prior in gca.priors().iter() {
        w.write_i32(to_i32(prior.len(), "prior label count")?)?;
        w.write_i32(to_i32(prior.total_training as usize, "training count")?)?;
        for (label, p) in prior.iter() {
            w.write_u8(label)?;
            w.write_f32(p)?;
        }
    }
    write_tags(&mut w, gca)
}

/// 以旧版本布局编码 node 网格. 只用于测试旧格式的读取.
#[cfg(test)]
pub(super) fn write_legacy<W: Write>(gca: &Gca, version: f32, output: W) -> GcaResult<()> {
    let mut w = ByteOrdered::runtime(output, Endianness::Big);
    let mrf = gca.uses_mrf();
    w.write_f32(version)?;
    w.write_f32(gca.node_spacing() as f32)?;
    write_dims(&mut w, gca.node_dims())?;
    w.write_i32(gca.ninputs() as i32)?;
    w.write_i32(gca.flags() as i32)?;
    for (pos, node) in gca.nodes().indexed_iter() {
        let prior = gca.prior(gca.node_to_prior(pos));
        w.write_i32(node.len() as i32)?;
        w.write_i32(node.total_training as i32)?;
        for (label, gc) in node.iter() {
            w.write_u8(label)?;
            w.write_f32(prior.prior(label))?;
            write_gc(&mut w, gc, mrf)?;
        }
    }
    Ok(())
}
