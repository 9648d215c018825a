//! 图谱文件的读写.
//!
//! 文件布局 (大端):
//!
//! 1. 头部: 版本 (`f32`), prior / node 间距 (`f32`), prior / node 网格尺寸 (各 3 个 `i32`),
//!    特征数与标志位 (`i32`).
//! 2. node 网格, `x -> y -> z` 顺序. 每个单元: 标签数, 训练计数, 然后每个标签:
//!    标签字节, 均值, 压缩协方差, 以及 (未设置 `GCA_NO_MRF` 时) 6 个方向的邻居直方图.
//! 3. prior 网格. 每个单元: 标签数, 训练计数, 然后每个标签: 标签字节, 先验.
//! 4. 扩展段: 若干 `tag: i32, nbytes: i32, payload`, 直到文件结束. 未知的标签被跳过.
//!
//! 以 `.gz` 结尾的文件名自动 gzip 压缩 / 解压.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::gca::Gca;
use crate::sync::SharedAtlas;
use crate::GcaResult;

mod format;

/// 文件名是否以 `.gz` 结尾?
pub fn is_gz_file<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .file_name()
        .is_some_and(|n| n.to_string_lossy().ends_with(".gz"))
}

impl Gca {
    /// 从字节流读取图谱.
    ///
    /// 版本比当前版本新时返回 [`crate::GcaError::UnsupportedVersion`];
    /// 旧版本按单一间距布局读取, prior 网格以 node 间距重建.
    pub fn read_from<R: Read>(input: R) -> GcaResult<Self> {
        format::read_gca(input)
    }

    /// 以当前版本写入字节流.
    pub fn write_to<W: Write>(&self, output: W) -> GcaResult<()> {
        format::write_gca(self, output)
    }

    /// 读取图谱文件.
    pub fn load<P: AsRef<Path>>(path: P) -> GcaResult<Self> {
        let path = path.as_ref();
        let file = BufReader::new(File::open(path)?);
        let gca = if is_gz_file(path) {
            Self::read_from(GzDecoder::new(file))?
        } else {
            Self::read_from(file)?
        };
        log::info!(
            "atlas read from {}: node grid {:?}, prior grid {:?}, {} inputs",
            path.display(),
            gca.node_dims(),
            gca.prior_dims(),
            gca.ninputs()
        );
        Ok(gca)
    }

    /// 写入图谱文件.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> GcaResult<()> {
        let path = path.as_ref();
        let file = BufWriter::new(File::create(path)?);
        if is_gz_file(path) {
            let mut e = GzEncoder::new(file, Compression::default());
            self.write_to(&mut e)?;
            e.finish()?.flush()?;
        } else {
            let mut file = file;
            self.write_to(&mut file)?;
            file.flush()?;
        }
        log::info!("atlas written to {}", path.display());
        Ok(())
    }
}

impl SharedAtlas {
    /// 持有写锁写入图谱文件, 期间不会有其他读者或写者.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> GcaResult<()> {
        self.write().save(path)
    }
}

/// 比较两个图谱在文件格式覆盖的所有字段上是否一致.
#[cfg(test)]
pub(crate) fn assert_same_atlas(a: &Gca, b: &Gca) {
    assert_eq!(a.node_spacing(), b.node_spacing());
    assert_eq!(a.prior_spacing(), b.prior_spacing());
    assert_eq!(a.node_dims(), b.node_dims());
    assert_eq!(a.prior_dims(), b.prior_dims());
    assert_eq!(a.ninputs(), b.ninputs());
    assert_eq!(a.flags(), b.flags());
    assert_eq!(a.gca_type(), b.gca_type());
    assert_eq!(a.sequence(), b.sequence());
    assert_eq!(a.tissue_table(), b.tissue_table());
    assert_eq!(a.geometry(), b.geometry());
    let mrf = a.uses_mrf();
    for ((pos, na), nb) in a.nodes().indexed_iter().zip(b.nodes().iter()) {
        assert_eq!(na.labels(), nb.labels(), "node {pos:?}");
        assert_eq!(na.total_training, nb.total_training, "node {pos:?}");
        for (ga, gb) in na.gcs().iter().zip(nb.gcs()) {
            assert_eq!(ga.means, gb.means, "node {pos:?}");
            assert_eq!(ga.covars, gb.covars, "node {pos:?}");
            if mrf {
                assert_eq!(ga.nbrs, gb.nbrs, "node {pos:?}");
            }
        }
    }
    for ((pos, pa), pb) in a.priors().indexed_iter().zip(b.priors().iter()) {
        assert_eq!(pa.labels(), pb.labels(), "prior {pos:?}");
        assert_eq!(pa.priors(), pb.priors(), "prior {pos:?}");
        assert_eq!(pa.total_training, pb.total_training, "prior {pos:?}");
    }
}

#[cfg(test)]
mod tests {
    use byteordered::ByteOrdered;

    use super::*;
    use crate::consts::{flags, GcaType};
    use crate::gca::{PulseParams, TissueParms};
    use crate::phantom::{cube_case, train_atlas};
    use crate::{GcaError, VolumeGeometry};

    fn trained() -> Gca {
        train_atlas(&cube_case((8, 8, 8), (2, 2, 2), (4, 4, 4), 2, 1), 2.0, 1.0).unwrap()
    }

    fn round_trip(gca: &Gca) -> Gca {
        let mut buf = Vec::new();
        gca.write_to(&mut buf).unwrap();
        Gca::read_from(buf.as_slice()).unwrap()
    }

    #[test]
    fn test_round_trip_trained_atlas() {
        let gca = trained();
        assert_same_atlas(&gca, &round_trip(&gca));
    }

    #[test]
    fn test_round_trip_extensions_and_full_cells() {
        let geometry = VolumeGeometry::new((4, 4, 4), [2.0, 2.0, 2.0])
            .with_dircos([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, -1.0, 0.0])
            .with_center([10.0, -4.5, 3.25]);
        let mut gca = Gca::new(1, 4.0, 2.0, geometry, flags::GCA_NO_MRF);
        // 一个单元装满所有可能的标签, 其余为空
        let node = gca.node_mut((0, 0, 0));
        for l in 0..=u8::MAX {
            let i = node.find_or_insert(l, 1);
            node.gcs_mut()[i].means[0] = l as f32;
            node.gcs_mut()[i].covars[0] = 1.0 + l as f32;
        }
        node.total_training = 256;
        gca.prior_mut((1, 1, 1)).add(7);
        gca.set_gca_type(GcaType::Flash);
        gca.set_sequence(vec![PulseParams {
            tr: 20.0,
            flip_angle: 0.5,
            te: 5.0,
        }]);
        gca.set_tissue_parms(
            2,
            TissueParms {
                t1: 950.0,
                pd: 700.0,
                t2: 0.0,
            },
        );

        let back = round_trip(&gca);
        assert_same_atlas(&gca, &back);
        assert_eq!(back.node((0, 0, 0)).len(), 256);
        assert!(back.node((1, 0, 0)).is_empty());
    }

    #[test]
    fn test_unknown_tag_is_skipped() {
        let gca = trained();
        let mut buf = Vec::new();
        gca.write_to(&mut buf).unwrap();
        {
            let mut w = ByteOrdered::be(&mut buf);
            w.write_i32(99).unwrap();
            w.write_i32(5).unwrap();
            w.write_all(&[1, 2, 3, 4, 5]).unwrap();
        }
        assert_same_atlas(&gca, &Gca::read_from(buf.as_slice()).unwrap());

        // 长度超出文件的标签段是错误
        let mut w = ByteOrdered::be(&mut buf);
        w.write_i32(98).unwrap();
        w.write_i32(100).unwrap();
        assert!(matches!(
            Gca::read_from(buf.as_slice()),
            Err(GcaError::MalformedFile(_))
        ));
    }

    #[test]
    fn test_version_and_truncation() {
        let gca = trained();
        let mut buf = Vec::new();
        gca.write_to(&mut buf).unwrap();

        let mut newer = buf.clone();
        newer[..4].copy_from_slice(&5.0f32.to_be_bytes());
        assert!(matches!(
            Gca::read_from(newer.as_slice()),
            Err(GcaError::UnsupportedVersion(v)) if v == 5.0
        ));

        buf.truncate(buf.len() / 2);
        assert!(Gca::read_from(buf.as_slice()).is_err());
        assert!(matches!(Gca::load("/nonexistent/atlas.gca"), Err(GcaError::Io(_))));
    }

    #[test]
    fn test_legacy_layout() {
        let gca = train_atlas(&cube_case((6, 6, 6), (1, 1, 1), (3, 3, 3), 1, 2), 2.0, 2.0).unwrap();
        let mut buf = Vec::new();
        format::write_legacy(&gca, 3.0, &mut buf).unwrap();
        let back = Gca::read_from(buf.as_slice()).unwrap();

        assert_eq!(back.prior_spacing(), 2.0);
        assert_eq!(back.prior_dims(), gca.prior_dims());
        assert_eq!(back.geometry(), gca.geometry());
        for (pos, prior) in gca.priors().indexed_iter() {
            assert_eq!(back.prior(pos).labels(), prior.labels());
            assert_eq!(back.prior(pos).priors(), prior.priors());
        }
        for (a, b) in gca.nodes().iter().zip(back.nodes()) {
            assert_eq!(a.labels(), b.labels());
            assert_eq!(a.gcs()[0].means, b.gcs()[0].means);
        }
    }

    #[test]
    fn test_gzip_file() {
        let gca = trained();
        let dir = std::env::temp_dir().join(format!("gca-berry-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let plain = dir.join("atlas.gca");
        let packed = dir.join("atlas.gca.gz");
        gca.save(&plain).unwrap();
        SharedAtlas::new(gca.clone()).save(&packed).unwrap();

        let raw = std::fs::read(&packed).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
        assert_same_atlas(&Gca::load(&plain).unwrap(), &Gca::load(&packed).unwrap());
        assert_same_atlas(&gca, &Gca::load(&packed).unwrap());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
