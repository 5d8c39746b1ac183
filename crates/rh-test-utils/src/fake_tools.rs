//! `sh` scripts that stand in for the reconstruction toolchain in tests.
//!
//! Each script honours the argument conventions of the tool it replaces and
//! moves bytes the way the real tool would, leaving a trace of what it was
//! asked to do: the final output of a full job is
//! `<input>[m<measurement>]|<stage>...@<group>`. Arguments arrive as `$1..`.

/// Capability report printed by [`reconstruction`] for `--info`.
pub const INFO_REPORT: &str = "\
Gadgetron Version Info
  -- Version            : 4.4.0
  -- Git SHA1           : 0123abcd
  -- System Memory size : 16384 MB
  -- Python Support     : YES
  -- Julia Support      : NO
  -- Matlab Support     : NO
  -- CUDA Support       : NO
";

/// Reconstruction engine. Copies `--input_path` (or stdin) to stdout and
/// appends `|<configuration>` plus any extra arguments. Configuration
/// `fail` exits 7; `hang` sleeps far past any test timeout.
#[must_use]
pub fn reconstruction(info_report: &str) -> String {
    format!(
        r#"cfg=""; input=""; extra=""
while [ $# -gt 0 ]; do
  case "$1" in
    --info) printf '%s' '{report}' >&2; exit 0 ;;
    --from_stream) ;;
    -c) cfg="$2"; shift ;;
    --input_path) input="$2"; shift ;;
    *) extra="$extra $1" ;;
  esac
  shift
done
echo "stage $cfg starting" >&2
if [ "$cfg" = "fail" ]; then echo "stage $cfg failed" >&2; exit 7; fi
if [ "$cfg" = "hang" ]; then exec sleep 30; fi
if [ -n "$input" ]; then cat "$input"; else cat; fi
printf '|%s%s' "$cfg" "$extra""#,
        report = info_report.replace('\'', "'\\''")
    )
}

/// Raw vendor format to intermediate file: `-f IN ... -o OUT -z MEAS [FLAG]`.
pub const SIEMENS_TO_ISMRMRD: &str = r#"input=""; out=""; meas=""
while [ $# -gt 0 ]; do
  case "$1" in
    -f) input="$2"; shift ;;
    -o) out="$2"; shift ;;
    -z) meas="$2"; shift ;;
    -m|-x) shift ;;
  esac
  shift
done
echo "converting measurement $meas"
{ cat "$input"; printf '[m%s]' "$meas"; } > "$out""#;

/// Intermediate file to stream: `-i IN --use-stdout`.
pub const ISMRMRD_HDF5_TO_STREAM: &str = r#"input=""
while [ $# -gt 0 ]; do
  case "$1" in
    -i) input="$2"; shift ;;
  esac
  shift
done
cat "$input""#;

/// Stream to stream-container file: `-o OUT`.
pub const ISMRMRD_TO_MRD: &str = r#"out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
  esac
  shift
done
cat > "$out""#;

/// Stream pass-through.
pub const MRD_TO_ISMRMRD: &str = "cat";

/// Stream to output file: `--use-stdin -o OUT [-g GROUP]`.
pub const ISMRMRD_STREAM_TO_HDF5: &str = r#"out=""; group=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    -g) group="$2"; shift ;;
  esac
  shift
done
{ cat; printf '@%s' "$group"; } > "$out""#;

/// A converter that always fails with exit status 3.
pub const FAILING_TOOL: &str = "echo 'conversion failed' >&2; exit 3";

#[cfg(test)]
mod tests {
    use super::{INFO_REPORT, reconstruction};

    #[test]
    fn reconstruction_script_embeds_quoted_report() {
        let script = reconstruction("it's");
        assert!(script.contains(r"'it'\''s'"));
        assert!(reconstruction(INFO_REPORT).contains("CUDA Support"));
    }
}
