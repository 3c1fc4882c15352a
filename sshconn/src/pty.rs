use byteorder::{BigEndian, ByteOrder};
use log::debug;
use ssh_encoding::{Decode, Encode};

/// Terminal mode opcodes, see [RFC 4254 §8](https://tools.ietf.org/html/rfc4254#section-8).
#[allow(non_camel_case_types, missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Pty {
    TTY_OP_END = 0,
    VINTR = 1,
    VQUIT = 2,
    VERASE = 3,
    VKILL = 4,
    VEOF = 5,
    VEOL = 6,
    VEOL2 = 7,
    VSTART = 8,
    VSTOP = 9,
    VSUSP = 10,
    VDSUSP = 11,
    VREPRINT = 12,
    VWERASE = 13,
    VLNEXT = 14,
    VFLUSH = 15,
    VSWTCH = 16,
    VSTATUS = 17,
    VDISCARD = 18,
    IGNPAR = 30,
    PARMRK = 31,
    INPCK = 32,
    ISTRIP = 33,
    INLCR = 34,
    IGNCR = 35,
    ICRNL = 36,
    IUCLC = 37,
    IXON = 38,
    IXANY = 39,
    IXOFF = 40,
    IMAXBEL = 41,
    IUTF8 = 42,
    ISIG = 50,
    ICANON = 51,
    XCASE = 52,
    ECHO = 53,
    ECHOE = 54,
    ECHOK = 55,
    ECHONL = 56,
    NOFLSH = 57,
    TOSTOP = 58,
    IEXTEN = 59,
    ECHOCTL = 60,
    ECHOKE = 61,
    PENDIN = 62,
    OPOST = 70,
    OLCUC = 71,
    ONLCR = 72,
    OCRNL = 73,
    ONOCR = 74,
    ONLRET = 75,
    CS7 = 90,
    CS8 = 91,
    PARENB = 92,
    PARODD = 93,
    TTY_OP_ISPEED = 128,
    TTY_OP_OSPEED = 129,
}

impl Pty {
    #[doc(hidden)]
    pub fn from_u8(x: u8) -> Option<Pty> {
        use Pty::*;
        Some(match x {
            0 => TTY_OP_END,
            1 => VINTR,
            2 => VQUIT,
            3 => VERASE,
            4 => VKILL,
            5 => VEOF,
            6 => VEOL,
            7 => VEOL2,
            8 => VSTART,
            9 => VSTOP,
            10 => VSUSP,
            11 => VDSUSP,
            12 => VREPRINT,
            13 => VWERASE,
            14 => VLNEXT,
            15 => VFLUSH,
            16 => VSWTCH,
            17 => VSTATUS,
            18 => VDISCARD,
            30 => IGNPAR,
            31 => PARMRK,
            32 => INPCK,
            33 => ISTRIP,
            34 => INLCR,
            35 => IGNCR,
            36 => ICRNL,
            37 => IUCLC,
            38 => IXON,
            39 => IXANY,
            40 => IXOFF,
            41 => IMAXBEL,
            42 => IUTF8,
            50 => ISIG,
            51 => ICANON,
            52 => XCASE,
            53 => ECHO,
            54 => ECHOE,
            55 => ECHOK,
            56 => ECHONL,
            57 => NOFLSH,
            58 => TOSTOP,
            59 => IEXTEN,
            60 => ECHOCTL,
            61 => ECHOKE,
            62 => PENDIN,
            70 => OPOST,
            71 => OLCUC,
            72 => ONLCR,
            73 => OCRNL,
            74 => ONOCR,
            75 => ONLRET,
            90 => CS7,
            91 => CS8,
            92 => PARENB,
            93 => PARODD,
            128 => TTY_OP_ISPEED,
            129 => TTY_OP_OSPEED,
            _ => return None,
        })
    }
}

/// The terminal a client asked for with `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyInfo {
    /// Height in characters.
    pub rows: u32,
    /// Width in characters.
    pub cols: u32,
    /// Width in pixels, zero when unknown.
    pub width: u32,
    /// Height in pixels, zero when unknown.
    pub height: u32,
    /// Value of `TERM`, e.g. `vt100`.
    pub term: String,
    /// Encoded terminal modes, in the order they were sent.
    pub modes: Vec<(Pty, u32)>,
}

impl Default for PtyInfo {
    fn default() -> Self {
        PtyInfo {
            rows: 24,
            cols: 80,
            width: 640,
            height: 480,
            term: "vt100".to_string(),
            modes: Vec::new(),
        }
    }
}

impl PtyInfo {
    /// Writes the `pty-req` specific part of a channel request.
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> Result<(), ssh_encoding::Error> {
        self.term.encode(w)?;
        self.cols.encode(w)?;
        self.rows.encode(w)?;
        self.width.encode(w)?;
        self.height.encode(w)?;
        encode_modes(&self.modes).as_slice().encode(w)?;
        Ok(())
    }

    pub(crate) fn decode(r: &mut &[u8]) -> Result<Self, crate::Error> {
        let term = String::decode(r)?;
        let cols = u32::decode(r)?;
        let rows = u32::decode(r)?;
        let width = u32::decode(r)?;
        let height = u32::decode(r)?;
        let modes = decode_modes(&Vec::<u8>::decode(r)?);
        Ok(PtyInfo {
            rows,
            cols,
            width,
            height,
            term,
            modes,
        })
    }
}

fn encode_modes(modes: &[(Pty, u32)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 * modes.len() + 1);
    for &(code, value) in modes {
        if code == Pty::TTY_OP_END {
            continue;
        }
        buf.push(code as u8);
        let mut v = [0; 4];
        BigEndian::write_u32(&mut v, value);
        buf.extend_from_slice(&v);
    }
    buf.push(Pty::TTY_OP_END as u8);
    buf
}

fn decode_modes(mut modes: &[u8]) -> Vec<(Pty, u32)> {
    let mut result = Vec::new();
    while let Some((&code, rest)) = modes.split_first() {
        // Opcodes 160 to 255 have no defined argument format, parsing stops there.
        if code == Pty::TTY_OP_END as u8 || code >= 160 || rest.len() < 4 {
            break;
        }
        let (value, rest) = rest.split_at(4);
        let value = BigEndian::read_u32(value);
        modes = rest;
        match Pty::from_u8(code) {
            Some(code) => result.push((code, value)),
            None => debug!("pty-req: unknown pty code {:?}", code),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pty_info_survives_the_wire() {
        let info = PtyInfo {
            rows: 2,
            cols: 4,
            width: 0,
            height: 0,
            term: "vt220".to_string(),
            modes: vec![(Pty::ECHO, 1), (Pty::TTY_OP_ISPEED, 38400)],
        };
        let mut buf = Vec::new();
        info.encode(&mut buf).unwrap();
        let mut r = &buf[..];
        assert_eq!(PtyInfo::decode(&mut r).unwrap(), info);
        assert!(r.is_empty());
    }

    #[test]
    fn unknown_mode_codes_are_skipped() {
        let modes = [20, 0, 0, 0, 1, 53, 0, 0, 0, 1, 0];
        assert_eq!(decode_modes(&modes), vec![(Pty::ECHO, 1)]);
        assert!(decode_modes(&[]).is_empty());
        // truncated argument
        assert!(decode_modes(&[53, 0, 0]).is_empty());
    }
}
