// Opcode names for the scene VM. Names follow the engine's own debug
// symbols where they are known; gaps in the byte space are opcodes that never
// appear in shipped scripts.

pub const LOOP_COND: u8 = 0x06;
pub const RET2: u8 = 0x0D;
pub const MESSAGE: u8 = 0x18;
pub const SELECT: u8 = 0x1B;
pub const SELECT2: u8 = 0x1D;

pub const LOOP_COND_NAME: &str = "Loop_Cond";
pub const NOP_NAME: &str = "nop";

const OPCODES: &[(u8, &str)] = &[
    (0x00, "nop"),
    (0x06, "Loop_Cond"),
    (0x09, "ext_Goto"),
    (0x0A, "ext_Call"),
    (0x0B, "ext_Goto2"),
    (0x0C, "ext_Call2"),
    (0x0D, "ret2"),
    (0x0E, "thread"),
    (0x14, "skip_jump"),
    (0x15, "key_wait"),
    (0x18, "message"),
    (0x1A, "windows"),
    (0x1B, "select"),
    (0x1C, "selectP"),
    (0x1D, "select2"),
    (0x1E, "popup"),
    (0x1F, "mes_sync"),
    (0x20, "scr_mode"),
    (0x21, "set_save_point"),
    (0x22, "clear_save_point"),
    (0x23, "set_prv_point"),
    (0x24, "mes_log"),
    (0x25, "auto_start"),
    (0x26, "auto_stop"),
    (0x27, "quick_Save"),
    (0x28, "title_display"),
    (0x29, "date_display"),
    (0x2B, "location_display"),
    (0x2C, "get_options"),
    (0x2D, "set_icon"),
    (0x2E, "menu_enable"),
    (0x2F, "menu_disable"),
    (0x30, "fade_out"),
    (0x31, "fade_in"),
    (0x32, "fade_out_start"),
    (0x33, "fade_out_stop"),
    (0x34, "fade_wait"),
    (0x36, "fade_pri"),
    (0x38, "filt_in"),
    (0x39, "filt_out"),
    (0x3A, "filt_in_start"),
    (0x3B, "filt_out_start"),
    (0x3C, "filt_wait"),
    (0x3E, "filt_pri"),
    (0x40, "char_init"),
    (0x42, "char_display"),
    (0x43, "char_ers"),
    (0x50, "char_no"),
    (0x51, "char_on"),
    (0x52, "char_pri"),
    (0x53, "char_animation"),
    (0x54, "char_sort"),
    (0x55, "char_swap"),
    (0x56, "char_shadow"),
    (0x57, "char_ret"),
    (0x59, "char_attack"),
    (0x5F, "get_background_c"),
    (0x60, "obj_ini"),
    (0x62, "obj_display"),
    (0x63, "obj_erase"),
    (0x70, "obj_no"),
    (0x71, "obj_on"),
    (0x72, "obj_pri"),
    (0x73, "obj_animation"),
    (0x74, "obj_sort"),
    (0x75, "obj_swap"),
    (0x80, "face_ini"),
    (0x82, "face_display"),
    (0x83, "face_erase"),
    (0x84, "face_pos"),
    (0x85, "face_auto_pis"),
    (0x88, "face_no"),
    (0x89, "face_on"),
    (0x8A, "face_pri"),
    (0x8B, "face_animation"),
    (0x8E, "face_shadow"),
    (0x8F, "face_ret"),
    (0x90, "bg_init"),
    (0x91, "bg_display"),
    (0x92, "bg_erase"),
    (0x93, "bg_flag"),
    (0x9B, "bg_on"),
    (0x9C, "bg_pri"),
    (0x9D, "bg_att"),
    (0x9E, "bg_bnk"),
    (0x9F, "bg_swap"),
    (0xA1, "effect_start"),
    (0xA2, "effect_par"),
    (0xA3, "effect_stop"),
    (0xB0, "event_ini"),
    (0xB1, "event_release"),
    (0xB2, "event_load"),
    (0xB3, "event_open"),
    (0xB4, "event_close"),
    (0xB5, "event_key_wait"),
    (0xC8, "sound_effect_play"),
    (0xC9, "sound_effect_start"),
    (0xCA, "sound_effect_stop"),
    (0xCB, "sound_effect_wait"),
    (0xCC, "sound_effect_vol"),
    (0xCE, "s_sound_effect_start"),
    (0xD0, "voice_over_play"),
    (0xD1, "voice_over_start"),
    (0xD2, "voice_over_stop"),
    (0xD3, "voice_over_wait"),
    (0xD4, "voice_over_sts"),
    (0xD8, "moive_play"),
    (0xD9, "movie_start"),
    (0xDA, "move_stop"),
    (0xDB, "move_wait"),
    (0xDC, "key_start"),
    (0xE0, "vibration_start"),
    (0xE1, "vibration_stop"),
    (0xE2, "screen_calen_start"),
    (0xE3, "screen_calen_end"),
    (0xE4, "RT"),
    (0xF0, "print"),
    (0xF1, "debug_set"),
    (0xF2, "debug_get"),
    (0xF3, "title_on"),
    (0xF4, "dict_set"),
    (0xF5, "dict_flag"),
    (0xF6, "message_flag"),
    (0xF7, "sel_flag"),
    (0xF8, "mes_log_save"),
    (0xF9, "set_back_col"),
    (0xFA, "set_name"),
    (0xFB, "Tlst_call_on"),
    (0xFC, "set_thum"),
    (0xFE, "eot"),
    (0xFF, "eos"),
];

// Alternative spellings accepted by the assembler only.
const ALIASES: &[(&str, u8)] = &[("Rain_Effect", 0xA1)];

pub fn mnemonic(op: u8) -> Option<&'static str> {
    OPCODES
        .iter()
        .find(|(code, _)| *code == op)
        .map(|(_, name)| *name)
}

pub fn opcode(name: &str) -> Option<u8> {
    OPCODES
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(code, _)| *code)
        .or_else(|| {
            ALIASES
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, code)| *code)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        for (i, (_, a)) in OPCODES.iter().enumerate() {
            for (_, b) in &OPCODES[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn lookups_agree() {
        assert_eq!(mnemonic(MESSAGE), Some("message"));
        assert_eq!(opcode(LOOP_COND_NAME), Some(LOOP_COND));
        assert_eq!(opcode(NOP_NAME), Some(0x00));
        assert_eq!(opcode("Rain_Effect"), Some(0xA1));
        assert_eq!(mnemonic(0xA1), Some("effect_start"));
        assert_eq!(mnemonic(0x01), None);
    }
}
