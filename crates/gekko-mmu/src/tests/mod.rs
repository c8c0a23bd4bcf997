mod helpers;

mod proptest_translation;
