//! 实验结果.

use std::io::{self, Write};

use crate::strategies::Profile;

/// 将 `profile` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &Profile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn f64_to_display(f: Option<f64>) -> String {
        match f {
            Some(f) => format!("{f:.6}"),
            None => "/".to_string(),
        }
    }

    writeln!(w, "Profile `{name}`:")?;
    writeln!(w, "{S4}Cases: {}", p.get_cases())?;
    writeln!(w, "{S4}Wrong voxels: {}", p.get_errors())?;
    writeln!(w, "{S4}Error rate: {}", f64_to_display(p.get_error_rate()))?;
    writeln!(w, "{S4}Unconverged cases: {}", p.get_unconverged())?;
    writeln!(w, "{S4}Average passes: {}", f64_to_display(p.get_avg_passes()))?;
    writeln!(w, "{S4}Relabeling time: {} us", p.get_work_time_us())?;
    writeln!(
        w,
        "{S4}Average relabeling time: {} us",
        f64_to_display(p.get_avg_work_time_us())
    )?;
    writeln!(w, "{S4}Total machine time: {} us", p.get_real_time_us())?;
    let t = p.get_most_time_consuming().map(|d| d.as_micros() as f64);
    write!(w, "{S4}Most time-consuming case costs {} us", f64_to_display(t))?;
    Ok(())
}

/// 消融实验最终结果.
pub struct AblationResult {
    data: Vec<(&'static str, Profile)>,
}

impl AblationResult {
    pub fn from_iter<I: IntoIterator<Item = (&'static str, Profile)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 分析运行结果.
    pub fn analyze(&self) {
        utils::sep();
        let mut buf = Vec::with_capacity(512);

        for (key, profile) in self.data.iter() {
            describe_into(key, profile, &mut buf).expect("Writing to memory buffer");
            println!("{}", String::from_utf8_lossy(&buf));
            buf.clear();

            utils::sep();
        }
    }
}
